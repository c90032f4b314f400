//! Recording fakes for the process and metrics-backend interfaces.

use crate::error::{CollectError, Result};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::prometheus::{MetricsBackend, Series};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Records every command; commands containing a registered pattern fail
/// (or succeed with canned output) as scripted.
#[derive(Default)]
pub struct FakeRunner {
    pub commands: RefCell<Vec<String>>,
    pub detached: RefCell<Vec<String>>,
    failures: RefCell<Vec<(String, String, usize)>>,
    outputs: RefCell<Vec<(String, CommandOutput)>>,
}

impl FakeRunner {
    /// The next `times` commands containing `pattern` exit 1 with `stderr`.
    pub fn fail(&self, pattern: &str, stderr: &str, times: usize) {
        self.failures
            .borrow_mut()
            .push((pattern.to_string(), stderr.to_string(), times));
    }

    pub fn respond(&self, pattern: &str, stdout: &str, stderr: &str) {
        self.outputs.borrow_mut().push((
            pattern.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
    }

    pub fn ran(&self, pattern: &str) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let line = cmd.to_string();
        self.commands.borrow_mut().push(line.clone());
        let mut failures = self.failures.borrow_mut();
        if let Some(entry) = failures
            .iter_mut()
            .find(|(pattern, _, times)| *times > 0 && line.contains(pattern.as_str()))
        {
            entry.2 -= 1;
            return Err(CollectError::Command {
                command: line,
                status: "1".to_string(),
                stdout: String::new(),
                stderr: entry.1.clone(),
            });
        }
        let outputs = self.outputs.borrow();
        Ok(outputs
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    fn spawn_detached(&self, cmd: &CommandSpec) -> Result<()> {
        self.detached.borrow_mut().push(cmd.to_string());
        Ok(())
    }
}

/// Answers queries by substring match; records deletions.
#[derive(Default)]
pub struct FakeBackend {
    pub queries: RefCell<Vec<String>>,
    pub deletions: RefCell<Vec<String>>,
    answers: RefCell<Vec<(String, Vec<Series>)>>,
    failing_queries: RefCell<usize>,
    failing_deletions: RefCell<usize>,
}

impl FakeBackend {
    /// Queries containing `pattern` return one series per `(event, value)`;
    /// an empty event name produces an unlabelled series.
    pub fn answer(&self, pattern: &str, values: &[(&str, f64)]) {
        let series = values
            .iter()
            .map(|(event, value)| {
                let mut metric = BTreeMap::new();
                if !event.is_empty() {
                    metric.insert("event".to_string(), event.to_string());
                }
                Series {
                    metric,
                    value: Some((0.0, value.to_string())),
                    values: None,
                }
            })
            .collect();
        // Later registrations take precedence.
        self.answers.borrow_mut().insert(0, (pattern.to_string(), series));
    }

    pub fn fail_next_queries(&self, count: usize) {
        *self.failing_queries.borrow_mut() = count;
    }

    /// The next `count` deletions fail as if the store were unreachable.
    pub fn fail_deletions(&self, count: usize) {
        *self.failing_deletions.borrow_mut() = count;
    }
}

impl MetricsBackend for FakeBackend {
    fn query(&self, expr: &str) -> Result<Vec<Series>> {
        self.queries.borrow_mut().push(expr.to_string());
        {
            let mut failing = self.failing_queries.borrow_mut();
            if *failing > 0 {
                *failing -= 1;
                return Err(CollectError::Backend("status 'error'".to_string()));
            }
        }
        Ok(self
            .answers
            .borrow()
            .iter()
            .find(|(pattern, _)| expr.contains(pattern.as_str()))
            .map(|(_, series)| series.clone())
            .unwrap_or_default())
    }

    fn delete_series(&self, selector: &str) -> Result<()> {
        self.deletions.borrow_mut().push(selector.to_string());
        let mut failing = self.failing_deletions.borrow_mut();
        if *failing > 0 {
            *failing -= 1;
            return Err(CollectError::Backend("connection refused".to_string()));
        }
        Ok(())
    }
}
