//! Test discovery and execution against an evaluation namespace.
//!
//! A normalized test source is executed into the namespace, every `test_`
//! function it defined is run in name order, and each outcome lands in
//! exactly one bucket. Sub-check failures recorded while a parent test runs
//! become their own entries named by the parent plus a fixed suffix.

use serde::Serialize;

use crate::interp::{Interp, Signal, SubtestOutcome};
use crate::resolver::{member_names, LoadFailure, ModuleResolver};
use crate::value::Scope;

/// Functions with this name prefix are collected as tests.
pub const TEST_FN_PREFIX: &str = "test_";

/// Name suffix for recorded sub-check outcomes.
pub const SUBTEST_SUFFIX: &str = ".subtest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailureKind {
    Fail,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestFailure {
    pub kind: FailureKind,
    pub test: String,
    pub message: String,
}

/// Aggregated outcome of one suite run. `valid` holds iff nothing failed and
/// nothing errored.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestStats {
    pub valid: bool,
    pub run_count: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub errored_count: usize,
    pub skipped_count: usize,
    pub expected_failure_count: usize,
    pub unexpected_success_count: usize,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub errored: Vec<String>,
    pub skipped: Vec<String>,
    pub expected_failures: Vec<String>,
    pub unexpected_successes: Vec<String>,
    pub failures: Vec<TestFailure>,
}

impl TestStats {
    fn finalize(&mut self) {
        self.passed_count = self.passed.len();
        self.failed_count = self.failed.len();
        self.errored_count = self.errored.len();
        self.skipped_count = self.skipped.len();
        self.expected_failure_count = self.expected_failures.len();
        self.unexpected_success_count = self.unexpected_successes.len();
        self.valid = self.failed.is_empty() && self.errored.is_empty();
    }
}

/// Execute a normalized test source against the namespace and run every test
/// function it defines. Test functions are unbound from the namespace again
/// once the suite finishes, so repeated runs never see stale tests.
pub fn run_test_suite(
    interp: &mut Interp,
    resolver: &mut ModuleResolver,
    nspace: &Scope,
    source: &str,
    label: &str,
) -> Result<TestStats, LoadFailure> {
    interp.exec_in(resolver, source, label, nspace)?;
    let test_names: Vec<String> = member_names(nspace)
        .into_iter()
        .filter(|name| name.starts_with(TEST_FN_PREFIX))
        .collect();

    let mut stats = TestStats::default();
    for name in &test_names {
        let test = match nspace.get_local(name) {
            Some(test) => test,
            None => continue,
        };
        interp.begin_test();
        let outcome = interp.call_value(&test, Vec::new());
        record_outcome(&mut stats, name, outcome, interp.expect_failure);
        for subtest in interp.take_subtests() {
            let subtest_name = format!("{name}{SUBTEST_SUFFIX}");
            match subtest.outcome {
                SubtestOutcome::Failed(message) => {
                    stats.failed.push(subtest_name.clone());
                    stats.failures.push(TestFailure {
                        kind: FailureKind::Fail,
                        test: subtest_name,
                        message: format!("[{}] {message}", subtest.label),
                    });
                }
                SubtestOutcome::Errored(message) => {
                    stats.errored.push(subtest_name.clone());
                    stats.failures.push(TestFailure {
                        kind: FailureKind::Error,
                        test: subtest_name,
                        message: format!("[{}] {message}", subtest.label),
                    });
                }
            }
        }
    }
    for name in &test_names {
        nspace.remove(name);
    }
    stats.run_count = test_names.len();
    stats.finalize();
    Ok(stats)
}

fn record_outcome(
    stats: &mut TestStats,
    name: &str,
    outcome: Result<crate::value::Value, Signal>,
    expect_failure: bool,
) {
    match outcome {
        Ok(_) | Err(Signal::Return(_)) => {
            if expect_failure {
                stats.unexpected_successes.push(name.to_string());
            } else {
                stats.passed.push(name.to_string());
            }
        }
        Err(Signal::Failure(message)) => {
            if expect_failure {
                stats.expected_failures.push(name.to_string());
            } else {
                stats.failed.push(name.to_string());
                stats.failures.push(TestFailure {
                    kind: FailureKind::Fail,
                    test: name.to_string(),
                    message,
                });
            }
        }
        Err(Signal::Error(error)) => {
            if expect_failure {
                stats.expected_failures.push(name.to_string());
            } else {
                stats.errored.push(name.to_string());
                stats.failures.push(TestFailure {
                    kind: FailureKind::Error,
                    test: name.to_string(),
                    message: error.to_string(),
                });
            }
        }
        Err(Signal::Skip(_)) => {
            stats.skipped.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> TestStats {
        let mut interp = Interp::new();
        let mut resolver = ModuleResolver::new(Vec::new());
        let nspace = interp.globals().child();
        run_test_suite(&mut interp, &mut resolver, &nspace, source, "<test>").expect("suite")
    }

    #[test]
    fn outcomes_land_in_their_buckets() {
        let stats = run(
            "fn test_a_passes() {\n    assert_eq(1, 1);\n}\nfn test_b_fails() {\n    assert_eq(1, 2);\n}\nfn test_c_errors() {\n    let x = missing;\n}\nfn test_d_skips() {\n    skip(\"offline\");\n}\n",
        );
        assert_eq!(stats.run_count, 4);
        assert_eq!(stats.passed, vec!["test_a_passes"]);
        assert_eq!(stats.failed, vec!["test_b_fails"]);
        assert_eq!(stats.errored, vec!["test_c_errors"]);
        assert_eq!(stats.skipped, vec!["test_d_skips"]);
        assert!(!stats.valid);
        assert_eq!(stats.failures.len(), 2);
    }

    #[test]
    fn valid_requires_no_failures_and_no_errors() {
        let stats = run(
            "fn test_ok() {\n    assert_true(true);\n}\nfn test_skipped() {\n    skip(\"later\");\n}\n",
        );
        assert!(stats.valid);
        assert_eq!(stats.passed_count, 1);
        assert_eq!(stats.skipped_count, 1);
    }

    #[test]
    fn expected_failure_flips_the_buckets() {
        let stats = run(
            "fn test_known_bad() {\n    expect_failure();\n    assert_eq(1, 2);\n}\nfn test_surprise_pass() {\n    expect_failure();\n    assert_eq(1, 1);\n}\n",
        );
        assert_eq!(stats.expected_failures, vec!["test_known_bad"]);
        assert_eq!(stats.unexpected_successes, vec!["test_surprise_pass"]);
        assert!(stats.valid);
    }

    #[test]
    fn subtest_failures_are_named_with_the_suffix() {
        let stats = run(
            "fn test_parts() {\n    subtest(\"one\", || assert_eq(1, 1));\n    subtest(\"two\", || assert_eq(1, 2));\n}\n",
        );
        assert_eq!(stats.passed, vec!["test_parts"]);
        assert_eq!(stats.failed, vec!["test_parts.subtest"]);
        assert!(!stats.valid);
        assert_eq!(stats.failures[0].message, "[two] 1 != 2");
    }

    #[test]
    fn tests_run_in_name_order() {
        let stats = run(
            "fn test_b() {\n    pass;\n}\nfn test_a() {\n    pass;\n}\nfn test_c() {\n    pass;\n}\n",
        );
        assert_eq!(stats.passed, vec!["test_a", "test_b", "test_c"]);
    }

    #[test]
    fn test_functions_are_unbound_after_the_run() {
        let mut interp = Interp::new();
        let mut resolver = ModuleResolver::new(Vec::new());
        let nspace = interp.globals().child();
        run_test_suite(
            &mut interp,
            &mut resolver,
            &nspace,
            "fn test_once() {\n    pass;\n}\nlet keep = 1;\n",
            "<test>",
        )
        .expect("suite");
        assert!(nspace.get_local("test_once").is_none());
        assert!(nspace.get_local("keep").is_some());
    }

    #[test]
    fn helper_functions_are_callable_from_tests() {
        let stats = run(
            "fn helper(x) {\n    return x * 2;\n}\nfn test_uses_helper() {\n    assert_eq(helper(3), 6);\n}\n",
        );
        assert!(stats.valid);
        assert_eq!(stats.passed_count, 1);
    }
}
