mod compare;
mod limit;
mod loader;
mod process;
mod profile;
mod results;
mod runner;
mod scheduler;
mod schema;

use clap::{Parser, Subcommand};
use results::ReportOptions;
use runner::TestCase;
use scheduler::Scheduler;
use schema::Settings;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "yoke")]
#[command(about = "A directory-driven integration test harness for shell commands")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every test under the test root
    Run {
        /// Test root containing yoke_config.json and one directory per test
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Show everything: info, warnings and resolved profiles
        #[arg(short, long)]
        verbose: bool,
        /// Show info messages
        #[arg(long)]
        info: bool,
        /// Show warnings
        #[arg(long)]
        warnings: bool,
    },
    /// List the discovered tests without running them
    List {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Check the settings and every test profile without running anything
    Validate {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Write a starter yoke_config.json
    Init {
        /// Test root to create the settings file in
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Output the JSON schema of the settings file
    Schema,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if let Err(err) = builder.try_init() {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn load_settings_or_exit(root: &Path) -> Settings {
    match loader::load_settings(root) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {e}");
            std::process::exit(1);
        }
    }
}

fn find_tests_or_exit(root: &Path, settings: &Settings) -> Vec<String> {
    match loader::find_tests(root, &settings.prefix) {
        Ok(names) => names,
        Err(e) => {
            eprintln!("Error finding tests: {e}");
            std::process::exit(1);
        }
    }
}

/// Load and resolve every discovered test.
fn build_tests(root: &Path, settings: &Settings, names: Vec<String>) -> Vec<TestCase> {
    names
        .into_iter()
        .map(|name| {
            let dir = root.join(&name);
            let loaded = loader::load_profile(&dir);
            TestCase::new(name, dir, loaded, &settings.default_profile)
        })
        .collect()
}

const STARTER_SETTINGS: &str = r#"{
  "defaultProfile": {
    "name": "default",
    "command": "./test.sh",
    "stdout": "stdout.txt",
    "stderr": "stderr.txt",
    "limitOutput": 1048576,
    "maxTimePerCommand": 10,
    "pass": {
      "zeroExit": true
    }
  },
  "maxthreads": 0,
  "prefix": ""
}
"#;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            verbose,
            info,
            warnings,
        } => {
            init_logging(verbose);
            let options = ReportOptions {
                show_info: info || verbose,
                show_warnings: warnings || verbose,
            };

            let settings = load_settings_or_exit(&path);
            let names = find_tests_or_exit(&path, &settings);
            if verbose {
                for name in &names {
                    println!("Test found: {name}");
                }
            }
            let tests = build_tests(&path, &settings, names);

            let scheduler = Scheduler::new(&settings);
            let run_start = std::time::Instant::now();
            let finished = match scheduler.run(tests) {
                Ok(finished) => finished,
                Err(e) => {
                    eprintln!("Error starting test runtime: {e}");
                    std::process::exit(1);
                }
            };

            let mut total_passed = 0;
            let mut total_failed = 0;
            for case in &finished {
                if verbose {
                    println!(
                        "{} ({:.2?}):\n{}",
                        case.name,
                        case.result.duration,
                        case.render_profile()
                    );
                }
                print!("{}", case.result.render(options));
                if case.result.passed() {
                    total_passed += 1;
                } else {
                    total_failed += 1;
                }
            }

            println!(
                "\n{total_passed} passed, {total_failed} failed ({:.2?})",
                run_start.elapsed()
            );

            if total_failed > 0 {
                std::process::exit(1);
            }
        }
        Command::List { path } => {
            init_logging(false);
            let settings = load_settings_or_exit(&path);
            let names = find_tests_or_exit(&path, &settings);
            for case in build_tests(&path, &settings, names) {
                let mode = if case.concurrent() { "" } else { ", noconcurrent" };
                let steps = case.steps.len();
                println!("{} ({steps} step(s){mode})", case.name);
            }
        }
        Command::Validate { path } => {
            init_logging(false);
            let settings = load_settings_or_exit(&path);
            let names = find_tests_or_exit(&path, &settings);
            if names.is_empty() {
                eprintln!("No tests found at: {}", path.display());
                std::process::exit(1);
            }

            let mut errors = 0;
            let total = names.len();
            for case in build_tests(&path, &settings, names) {
                if case.result.passed() {
                    println!("✓ {} ({} step(s))", case.name, case.steps.len());
                } else {
                    for failure in case.result.failures() {
                        eprintln!("✗ {}: {failure}", case.name);
                    }
                    errors += 1;
                }
            }

            if errors > 0 {
                eprintln!("\n{errors} test(s) failed validation");
                std::process::exit(1);
            }
            println!("\nAll {total} test(s) valid");
        }
        Command::Init { path } => {
            let target = path.join(format!("{}.json", loader::SETTINGS_STEM));
            if target.exists() {
                eprintln!("Error: file already exists: {}", target.display());
                std::process::exit(1);
            }
            if !path.as_os_str().is_empty()
                && !path.exists()
                && let Err(e) = fs::create_dir_all(&path)
            {
                eprintln!("Error creating directory: {e}");
                std::process::exit(1);
            }
            if let Err(e) = fs::write(&target, STARTER_SETTINGS) {
                eprintln!("Error writing file: {e}");
                std::process::exit(1);
            }
            println!("Created: {}", target.display());
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            let json = serde_json::to_string_pretty(&schema).expect("Failed to serialize schema");
            println!("{json}");
        }
    }
}
