//! Validation & Retry Loop.
//!
//! [`ActionValidator`] judges one execution result structurally;
//! [`ValidationLoop`] feeds rejections back to the executor as a derived
//! Task until it is accepted, the turn budget runs out, or a terminal
//! failure (budget first among them) stops it.

use std::path::{Path, PathBuf};

use duet_core::types::{ExecutionHandle, FailureKind, SessionId, Task, TaskAction, TaskResult};
use duet_intelligence::UsageCharge;
use tracing::{debug, info, warn};

use crate::executor::TaskExecutor;

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

pub trait OutputValidator: Send + Sync {
    fn validate(&self, task: &Task, output: &str) -> Verdict;
}

// ---------------------------------------------------------------------------
// Test reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFramework {
    Cargo,
    Pytest,
    Jest,
    Go,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestReport {
    pub framework: TestFramework,
    pub passed: u32,
    pub failed: u32,
}

impl TestReport {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// The number immediately before `word` on `line`, e.g. `3` in "3 passed".
fn count_before(line: &str, word: &str) -> Option<u32> {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|t| !t.is_empty())
        .collect();
    tokens.windows(2).find_map(|pair| {
        let next = pair[1].trim_end_matches(|c: char| !c.is_alphanumeric());
        if next == word {
            pair[0].parse().ok()
        } else {
            None
        }
    })
}

/// Recognise a test-runner summary in agent output. Multiple summaries
/// (a cargo workspace, several go packages) are added up.
pub fn parse_test_report(output: &str) -> Option<TestReport> {
    let mut report: Option<TestReport> = None;
    let mut add = |framework: TestFramework, passed: u32, failed: u32| {
        let r = report.get_or_insert(TestReport {
            framework,
            passed: 0,
            failed: 0,
        });
        r.passed += passed;
        r.failed += failed;
    };

    for raw in output.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("test result:") {
            add(
                TestFramework::Cargo,
                count_before(rest, "passed").unwrap_or(0),
                count_before(rest, "failed").unwrap_or(0),
            );
        } else if let Some(rest) = line.strip_prefix("Tests:") {
            let passed = count_before(rest, "passed");
            let failed = count_before(rest, "failed");
            if passed.is_some() || failed.is_some() || count_before(rest, "total").is_some() {
                add(TestFramework::Jest, passed.unwrap_or(0), failed.unwrap_or(0));
            }
        } else if line.starts_with('=') && line.ends_with('=') && line.contains(" in ") {
            let passed = count_before(line, "passed");
            let failed = count_before(line, "failed");
            if passed.is_some() || failed.is_some() {
                add(TestFramework::Pytest, passed.unwrap_or(0), failed.unwrap_or(0));
            }
        } else if line.contains('\t') && (line.starts_with("ok ") || line.starts_with("ok\t")) {
            add(TestFramework::Go, 1, 0);
        } else if line.starts_with("FAIL\t") {
            add(TestFramework::Go, 0, 1);
        }
    }
    report
}

// ---------------------------------------------------------------------------
// ActionValidator
// ---------------------------------------------------------------------------

/// Structural acceptance per action:
///
/// * file-producing actions: the target exists under the workspace root and
///   is non-empty
/// * `run_tests`: the output contains a recognisable test report
/// * everything else: the agent said something
#[derive(Debug, Clone)]
pub struct ActionValidator {
    workspace_root: PathBuf,
}

impl ActionValidator {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    fn resolve(&self, target: &str) -> PathBuf {
        let path = Path::new(target);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    fn check_file(&self, task: &Task) -> Verdict {
        let Some(target) = task.target.as_deref() else {
            return Verdict::Reject(format!("{} task has no target file", task.action));
        };
        let path = self.resolve(target);
        match std::fs::metadata(&path) {
            Ok(meta) if !meta.is_file() => {
                Verdict::Reject(format!("{} is not a regular file", path.display()))
            }
            Ok(meta) if meta.len() == 0 => Verdict::Reject(format!("{} is empty", path.display())),
            Ok(_) => Verdict::Accept,
            Err(err) => Verdict::Reject(format!("{} was not produced: {err}", path.display())),
        }
    }
}

impl OutputValidator for ActionValidator {
    fn validate(&self, task: &Task, output: &str) -> Verdict {
        match task.action {
            action if action.produces_file() => self.check_file(task),
            TaskAction::RunTests => match parse_test_report(output) {
                Some(report) => {
                    debug!(passed = report.passed, failed = report.failed, "test report recognised");
                    Verdict::Accept
                }
                None => Verdict::Reject("no test report found in the output".into()),
            },
            _ if output.trim().is_empty() => Verdict::Reject("agent produced no output".into()),
            _ => Verdict::Accept,
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationLoop
// ---------------------------------------------------------------------------

pub struct ValidationLoop {
    validator: Box<dyn OutputValidator>,
    max_attempts: u32,
}

impl ValidationLoop {
    pub fn new(validator: Box<dyn OutputValidator>, max_attempts: u32) -> Self {
        Self {
            validator,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drive `task` to a terminal Result. Retries are strictly sequential:
    /// each one is built from the previous rejection.
    pub async fn run(
        &self,
        executor: &TaskExecutor,
        session: &SessionId,
        task: &Task,
        handle: Option<ExecutionHandle>,
    ) -> TaskResult {
        let mut current = task.clone();
        let mut handle = handle;
        let mut charge = UsageCharge::default();
        let mut attempts = 0u32;
        let mut last = (FailureKind::ValidationExhausted, String::new());

        for attempt in 1..=self.max_attempts {
            let outcome = executor.execute(session, &current, handle.take()).await;
            charge.add(outcome.charge);
            handle = outcome.handle;
            if outcome.agent_calls > 0 {
                attempts = attempt;
            }

            let diagnostic = match outcome.result {
                Ok(output) => match self.validator.validate(&current, &output) {
                    Verdict::Accept => {
                        info!(session_id = %session, task_id = %task.id, attempt, "task accepted");
                        return TaskResult::succeeded(output, attempts)
                            .with_usage(charge.usage, charge.cost_usd)
                            .with_handle(handle);
                    }
                    Verdict::Reject(reason) => {
                        last = (FailureKind::ValidationExhausted, reason.clone());
                        reason
                    }
                },
                Err(err) if err.is_terminal() => {
                    warn!(session_id = %session, task_id = %task.id, attempt, error = %err, "task stopped");
                    return TaskResult::failed(err.failure_kind(), err.to_string(), attempts)
                        .with_usage(charge.usage, charge.cost_usd)
                        .with_handle(handle);
                }
                Err(err) => {
                    last = (err.failure_kind(), err.to_string());
                    err.to_string()
                }
            };

            if attempt < self.max_attempts {
                info!(
                    session_id = %session,
                    task_id = %task.id,
                    attempt,
                    reason = %diagnostic,
                    "attempt rejected; retry scheduled"
                );
                current = current.with_feedback(&diagnostic);
            }
        }

        let (kind, diagnostic) = last;
        warn!(session_id = %session, task_id = %task.id, attempts, "attempts exhausted");
        TaskResult::failed(
            kind,
            format!("gave up after {attempts} attempts: {diagnostic}"),
            attempts,
        )
        .with_usage(charge.usage, charge.cost_usd)
        .with_handle(handle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cargo_summary() {
        let out = "running 3 tests\n...\ntest result: ok. 3 passed; 0 failed; 0 ignored; 0 measured";
        let report = parse_test_report(out).unwrap();
        assert_eq!(report.framework, TestFramework::Cargo);
        assert_eq!((report.passed, report.failed), (3, 0));
    }

    #[test]
    fn sums_cargo_workspace_summaries() {
        let out = "test result: ok. 2 passed; 0 failed;\ntest result: FAILED. 4 passed; 1 failed;";
        let report = parse_test_report(out).unwrap();
        assert_eq!((report.passed, report.failed), (6, 1));
        assert!(!report.all_passed());
    }

    #[test]
    fn parses_pytest_summary() {
        let out = "collected 5 items\n\n========= 4 passed, 1 failed in 0.31s =========";
        let report = parse_test_report(out).unwrap();
        assert_eq!(report.framework, TestFramework::Pytest);
        assert_eq!((report.passed, report.failed), (4, 1));
    }

    #[test]
    fn parses_jest_summary() {
        let out = "Test Suites: 1 passed, 1 total\nTests:       1 failed, 7 passed, 8 total";
        let report = parse_test_report(out).unwrap();
        assert_eq!(report.framework, TestFramework::Jest);
        assert_eq!((report.passed, report.failed), (7, 1));
    }

    #[test]
    fn parses_go_package_lines() {
        let out = "ok  \texample.com/a\t0.01s\nFAIL\texample.com/b\t0.02s";
        let report = parse_test_report(out).unwrap();
        assert_eq!(report.framework, TestFramework::Go);
        assert_eq!((report.passed, report.failed), (1, 1));
    }

    #[test]
    fn prose_is_not_a_report() {
        assert!(parse_test_report("I ran the tests and they look fine.").is_none());
    }

    #[test]
    fn file_actions_need_non_empty_target() {
        let dir = tempfile::tempdir().unwrap();
        let validator = ActionValidator::new(dir.path());
        let task = Task::new(TaskAction::CreateFile, "write notes")
            .unwrap()
            .with_target("notes.md");

        assert!(matches!(validator.validate(&task, "done"), Verdict::Reject(r) if r.contains("not produced")));

        std::fs::write(dir.path().join("notes.md"), "").unwrap();
        assert!(matches!(validator.validate(&task, "done"), Verdict::Reject(r) if r.contains("empty")));

        std::fs::write(dir.path().join("notes.md"), "# Notes").unwrap();
        assert_eq!(validator.validate(&task, "done"), Verdict::Accept);
    }

    #[test]
    fn run_tests_needs_report() {
        let validator = ActionValidator::new(".");
        let task = Task::new(TaskAction::RunTests, "run the suite").unwrap();
        assert!(matches!(validator.validate(&task, "all good"), Verdict::Reject(_)));
        assert_eq!(
            validator.validate(&task, "test result: ok. 1 passed; 0 failed;"),
            Verdict::Accept
        );
    }

    #[test]
    fn explain_needs_output() {
        let validator = ActionValidator::new(".");
        let task = Task::new(TaskAction::Explain, "explain lib.rs").unwrap();
        assert!(matches!(validator.validate(&task, "  "), Verdict::Reject(_)));
        assert_eq!(validator.validate(&task, "It re-exports."), Verdict::Accept);
    }
}
