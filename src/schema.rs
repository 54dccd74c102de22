//! Schema definitions for yoke configuration files.
//!
//! This module defines the structure of the suite settings file and of the
//! per-test profile files. Both are written in JSON (YAML and TOML are also
//! accepted) and deserialized into these types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Suite-level settings loaded from `yoke_config.json` in the test root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Profile that every test inherits unset fields from.
    #[serde(default)]
    pub default_profile: Profile,

    /// Maximum number of tests running at once (zero or negative: one per CPU).
    #[serde(default, rename = "maxthreads")]
    pub max_threads: i64,

    /// Only directories whose name starts with this prefix are tests.
    #[serde(default)]
    pub prefix: String,
}

/// Configuration for one test step.
///
/// Every field is optional. An unset field is inherited from the default
/// profile when the profile is resolved; there is no whole-object override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Display name of the profile, used in diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Commands run, in order, before the main command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<String>>,

    /// The main test command, run through `sh -c`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Commands run, in order, after the pass conditions are evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<String>>,

    /// Files concatenated, in order, into each command's standard input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Vec<String>>,

    /// File receiving each command's standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// File receiving each command's standard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// Maximum number of bytes each command may write to each output stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_output: Option<i64>,

    /// Maximum run time of each command, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_per_command: Option<f64>,

    /// Files that must exist in the test directory before the step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_files: Option<Vec<String>>,

    /// Create missing required files instead of failing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_required: Option<bool>,

    /// Run this test alone, after all concurrent tests have finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noconcurrent: Option<bool>,

    /// Conditions checked after the main command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<PassConditions>,

    /// The step that runs after this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<Profile>>,
}

/// Assertions evaluated after a step's main command.
///
/// An unset condition is not checked at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PassConditions {
    /// Whether the main command must exit with status zero (or non-zero).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_exit: Option<bool>,

    /// Groups of files that must be byte-identical.
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_rules: Option<Vec<Vec<String>>>,

    /// Groups whose first file is a regular expression the others must match.
    #[serde(default, rename = "rmatch", skip_serializing_if = "Option::is_none")]
    pub rmatch_rules: Option<Vec<Vec<String>>>,

    /// Whether some command must (or must not) hit the output limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_reached: Option<bool>,

    /// Whether some command must (or must not) exceed its time limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_per_command_reached: Option<bool>,
}

/// Generate the JSON Schema for the settings file.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Settings)
}
