//! Per-test results and their textual report.

use crate::process::ExitOutcome;
use std::fmt::Write as _;
use std::time::Duration;

/// Which message classes to include when rendering a result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub show_info: bool,
    pub show_warnings: bool,
}

/// Outcome of one test, shared by every step of its chain.
#[derive(Debug, Clone)]
pub struct TestResult {
    name: String,
    passed: bool,
    /// Set once any command of the test hits its output limit.
    pub limit_reached: bool,
    /// Commands killed for exceeding their time limit, in order.
    pub exceeded_time_limit: Vec<String>,
    /// Exit outcome of the most recent main command.
    pub exit: Option<ExitOutcome>,
    pub duration: Duration,
    info: Vec<String>,
    warnings: Vec<String>,
    failures: Vec<String>,
}

impl TestResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            limit_reached: false,
            exceeded_time_limit: Vec::new(),
            exit: None,
            duration: Duration::ZERO,
            info: Vec::new(),
            warnings: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether no failure has been recorded.
    pub fn passed(&self) -> bool {
        self.passed
    }

    /// Record a failure. The test stays failed from here on.
    pub fn fail(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::debug!(test = %self.name, "failure: {msg}");
        self.failures.push(msg);
        self.passed = false;
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn info(&mut self, msg: impl Into<String>) {
        self.info.push(msg.into());
    }

    pub fn info_messages(&self) -> &[String] {
        &self.info
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Render the messages selected by `options`, one per line.
    ///
    /// Failures are always included, followed by a `<name>: failed` line when
    /// the test did not pass.
    pub fn render(&self, options: ReportOptions) -> String {
        let mut out = String::new();
        if options.show_info {
            for msg in self.info_messages() {
                let _ = writeln!(out, "{}(info): {msg}", self.name);
            }
        }
        if options.show_warnings {
            for msg in self.warnings() {
                let _ = writeln!(out, "{}(warning): {msg}", self.name);
            }
        }
        for msg in self.failures() {
            let _ = writeln!(out, "{}(failure): {msg}", self.name);
        }
        if !self.passed {
            let _ = writeln!(out, "{}: failed", self.name);
        }
        out
    }
}
