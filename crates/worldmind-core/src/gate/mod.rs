//! Quality gate: turns raw agent output into a structured
//! accept/retry/skip/escalate decision.
//!
//! The gate never judges code itself. It parses what the tester and
//! reviewer agents reported, combines the two sides under the configured
//! review threshold, and applies the task's failure policy, promoting RETRY
//! to ESCALATE when retries are exhausted.

pub mod oscillation;
pub mod review;

use std::sync::OnceLock;

use regex::Regex;

use crate::mission::{OnFailure, QualityDecision, ReviewFeedback, Task, TestResult};

// ---------------------------------------------------------------------------
// Test output parsing
// ---------------------------------------------------------------------------

fn tests_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+)").expect("valid regex")
    })
}

fn passed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+passed").expect("valid regex"))
}

fn failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+failed").expect("valid regex"))
}

/// Phrases that mark a build or test failure when no counter pattern
/// matched.
const FAILURE_PHRASES: &[&str] = &[
    "build failed",
    "build failure",
    "compilation error",
    "compile error",
    "cannot find symbol",
    "test run failed",
];

/// Derive a [`TestResult`] from the tester agent's raw output.
///
/// Tried in order: `Tests run: N, Failures: M`, then `N passed` / `N failed`
/// counters, then case-insensitive failure phrases. Output matching nothing
/// is treated as a pass with zero totals.
pub fn parse_test_output(task_id: &str, raw: &str, duration_ms: u64) -> TestResult {
    let mut result = TestResult {
        task_id: task_id.to_string(),
        passed: true,
        total_tests: 0,
        failed_tests: 0,
        raw_output: raw.to_string(),
        duration_ms,
    };

    if let Some(caps) = tests_run_re().captures(raw) {
        let total: u32 = caps[1].parse().unwrap_or(0);
        let failures: u32 = caps[2].parse().unwrap_or(0);
        result.total_tests = total;
        result.failed_tests = failures;
        result.passed = failures == 0;
        return result;
    }

    let passed_count = passed_re()
        .captures(raw)
        .and_then(|c| c[1].parse::<u32>().ok());
    let failed_count = failed_re()
        .captures(raw)
        .and_then(|c| c[1].parse::<u32>().ok());
    if passed_count.is_some() || failed_count.is_some() {
        let passed = passed_count.unwrap_or(0);
        let failed = failed_count.unwrap_or(0);
        result.total_tests = passed + failed;
        result.failed_tests = failed;
        result.passed = failed == 0;
        return result;
    }

    let lowered = raw.to_ascii_lowercase();
    if FAILURE_PHRASES.iter().any(|p| lowered.contains(p)) {
        result.passed = false;
        return result;
    }

    result
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Combine test and review results into the gate decision for one task
/// execution.
///
/// Grants when the tests passed and the review score clears `threshold`.
/// Otherwise the task's `on_failure` policy decides the next action, with
/// RETRY promoted to ESCALATE once `iteration` has reached
/// `max_iterations`.
pub fn decide(
    task: &Task,
    test: &TestResult,
    review: &ReviewFeedback,
    threshold: u8,
) -> QualityDecision {
    if test.passed && review.score >= threshold {
        return QualityDecision {
            granted: true,
            next_action: None,
            reason: format!(
                "tests passed ({}/{} failures) and review score {} >= {}",
                test.failed_tests, test.total_tests, review.score, threshold
            ),
        };
    }

    let mut reasons = Vec::new();
    if !test.passed {
        reasons.push(format!(
            "tests failed ({} of {} failing)",
            test.failed_tests, test.total_tests
        ));
    }
    if review.score < threshold {
        reasons.push(format!(
            "review score {} below threshold {}",
            review.score, threshold
        ));
    }

    let mut next_action = task.on_failure;
    if next_action == OnFailure::Retry && task.iteration >= task.max_iterations {
        reasons.push(format!(
            "retries exhausted ({}/{})",
            task.iteration, task.max_iterations
        ));
        next_action = OnFailure::Escalate;
    }

    QualityDecision {
        granted: false,
        next_action: Some(next_action),
        reason: reasons.join("; "),
    }
}
