//! Test execution engine.
//!
//! Runs one test's flattened profile chain and records everything that
//! happens on its [`TestResult`]. Every stage of a step runs even when an
//! earlier stage failed, so later problems still surface.

use crate::compare::{match_files, rmatch_files};
use crate::loader::LoadError;
use crate::process::{CommandIo, CommandReport, ExitOutcome, run_command};
use crate::profile::flatten_chain;
use crate::results::TestResult;
use crate::schema::Profile;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// One discovered test: its directory, resolved steps and shared result.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub dir: PathBuf,
    /// Resolved steps in execution order. Never empty.
    pub steps: Vec<Profile>,
    pub result: TestResult,
}

impl TestCase {
    /// Build a test from the outcome of loading its profile file.
    ///
    /// A missing profile runs on the defaults. An unreadable one fails the
    /// test and also runs on the defaults. A cyclic chain fails the test and
    /// runs the steps collected before the cycle.
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        loaded: Result<Option<Profile>, LoadError>,
        defaults: &Profile,
    ) -> Self {
        let name = name.into();
        let mut result = TestResult::new(name.clone());

        let own = match loaded {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                result.info("No config file found. Using default config");
                Profile::default()
            }
            Err(e) => {
                tracing::warn!(test = %name, error = %e, "unusable profile; using defaults");
                result.fail(format!("Unable to load profile: {e}"));
                Profile::default()
            }
        };

        let chain = flatten_chain(&own, defaults);
        if let Some(e) = chain.error {
            result.fail(e.to_string());
        }
        let steps = chain.steps;

        let config = steps.first().map_or("unnamed", |s| s.display_name());
        result.info(format!("Test loaded: {name} (config: {config})"));

        Self {
            name,
            dir: dir.into(),
            steps,
            result,
        }
    }

    /// Whether the test may run alongside others.
    pub fn concurrent(&self) -> bool {
        !self.steps.first().is_some_and(Profile::is_noconcurrent)
    }

    /// Pretty-printed resolved steps, one JSON document per step.
    pub fn render_profile(&self) -> String {
        self.steps
            .iter()
            .map(Profile::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run every step of the chain in order.
    pub async fn run(&mut self) {
        let started = Instant::now();
        let TestCase {
            dir, steps, result, ..
        } = self;

        if let Some(chain) = ChainRun::new(dir.as_path(), steps) {
            chain.execute(result).await;
        }

        result.duration = started.elapsed();
        tracing::info!(
            test = %result.name(),
            passed = result.passed(),
            exit = ?result.exit,
            elapsed_ms = result.duration.as_millis() as u64,
            "test finished"
        );
    }
}

/// Stages of one step, in execution order. `AdvanceOrDone` moves to the
/// next step of the chain or ends the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    CheckRequiredFiles,
    TruncateOutputs,
    RunBefore,
    RunMain,
    Evaluate,
    RunAfter,
    AdvanceOrDone,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::CheckRequiredFiles => Some(Stage::TruncateOutputs),
            Stage::TruncateOutputs => Some(Stage::RunBefore),
            Stage::RunBefore => Some(Stage::RunMain),
            Stage::RunMain => Some(Stage::Evaluate),
            Stage::Evaluate => Some(Stage::RunAfter),
            Stage::RunAfter => Some(Stage::AdvanceOrDone),
            Stage::AdvanceOrDone => None,
        }
    }
}

/// Walks a chain step by step. The exit, limit and time fields describe the
/// current step only and are reset when the chain advances.
struct ChainRun<'a> {
    dir: &'a Path,
    steps: &'a [Profile],
    index: usize,
    profile: &'a Profile,
    exit: Option<ExitOutcome>,
    limit_reached: bool,
    exceeded: Vec<String>,
}

impl<'a> ChainRun<'a> {
    /// `None` for an empty chain.
    fn new(dir: &'a Path, steps: &'a [Profile]) -> Option<Self> {
        let profile = steps.first()?;
        Some(Self {
            dir,
            steps,
            index: 0,
            profile,
            exit: None,
            limit_reached: false,
            exceeded: Vec::new(),
        })
    }

    /// Move to the next step, if there is one.
    fn advance(&mut self) -> Option<Stage> {
        let profile = self.steps.get(self.index + 1)?;
        self.index += 1;
        self.profile = profile;
        self.exit = None;
        self.limit_reached = false;
        self.exceeded.clear();
        Some(Stage::CheckRequiredFiles)
    }

    async fn execute(mut self, result: &mut TestResult) {
        let mut stage = Some(Stage::CheckRequiredFiles);
        while let Some(current) = stage {
            let profile = self.profile;
            tracing::debug!(test = %result.name(), step = self.index, stage = ?current, "stage");
            match current {
                Stage::CheckRequiredFiles => self.check_required_files(result),
                Stage::TruncateOutputs => self.truncate_outputs(result),
                Stage::RunBefore => {
                    if let Some(commands) = &profile.before {
                        self.run_commands(commands, result).await;
                    }
                }
                Stage::RunMain => self.run_main(result).await,
                Stage::Evaluate => self.evaluate(result),
                Stage::RunAfter => {
                    if let Some(commands) = &profile.after {
                        self.run_commands(commands, result).await;
                    }
                }
                Stage::AdvanceOrDone => {
                    stage = self.advance();
                    continue;
                }
            }
            stage = current.next();
        }
    }

    fn check_required_files(&self, result: &mut TestResult) {
        let Some(required) = &self.profile.required_files else {
            return;
        };
        let create = self.profile.create_required.unwrap_or(false);
        for name in required {
            let path = self.dir.join(name);
            if create {
                if let Err(e) = OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create(true)
                    .open(&path)
                {
                    result.fail(format!("Unable to open or create required file: {name}: {e}"));
                }
            } else if let Err(e) = std::fs::File::open(&path) {
                result.fail(format!("Unable to open required file: {name}: {e}"));
            }
        }
    }

    fn truncate_outputs(&self, result: &mut TestResult) {
        for name in [&self.profile.stdout, &self.profile.stderr]
            .into_iter()
            .flatten()
        {
            if let Err(e) = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(self.dir.join(name))
            {
                result.info(format!("Unable to open {name} for truncation: {e}"));
            }
        }
    }

    async fn run_commands(&mut self, commands: &[String], result: &mut TestResult) {
        for command in commands {
            let report = self.run(command, result).await;
            self.absorb(command, &report);
        }
    }

    async fn run_main(&mut self, result: &mut TestResult) {
        let profile = self.profile;
        let Some(command) = &profile.command else {
            result.fail("No test command specified");
            return;
        };
        let report = self.run(command, result).await;
        self.absorb(command, &report);
        self.exit = report.outcome;
        result.exit = report.outcome;
    }

    async fn run(&self, command: &str, result: &mut TestResult) -> CommandReport {
        run_command(command, CommandIo::from_profile(self.dir, self.profile), result).await
    }

    fn absorb(&mut self, command: &str, report: &CommandReport) {
        self.limit_reached |= report.limit_reached;
        if report.timed_out {
            self.exceeded.push(command.to_string());
        }
    }

    fn evaluate(&self, result: &mut TestResult) {
        let Some(pass) = &self.profile.pass else {
            result.info("No pass conditions specified");
            return;
        };

        for (index, files) in pass.match_rules.iter().flatten().enumerate() {
            match_files(self.dir, index, files, result);
        }
        for (index, files) in pass.rmatch_rules.iter().flatten().enumerate() {
            rmatch_files(self.dir, index, files, result);
        }

        if let Some(zero_expected) = pass.zero_exit {
            let succeeded = self.exit.is_some_and(|exit| exit.success());
            if zero_expected && !succeeded {
                result.fail("Non-zero exit status (zero expected)");
            } else if !zero_expected && succeeded {
                result.fail("Zero exit status (non-zero expected)");
            }
        }

        if let Some(limit_expected) = pass.limit_reached {
            if !limit_expected && self.limit_reached {
                result.fail("Output limit reached");
            } else if limit_expected && !self.limit_reached {
                result.fail("Output limit not reached");
            }
        }

        if let Some(time_expected) = pass.max_time_per_command_reached {
            if time_expected && self.exceeded.is_empty() {
                result.fail("Command time limit not reached");
            } else if !time_expected {
                for command in &self.exceeded {
                    result.fail(format!("Command time limit reached: {command}"));
                }
            }
        }
    }
}
