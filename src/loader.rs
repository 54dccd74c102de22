//! Settings and profile loader.
//!
//! Reads the suite settings from the test root, discovers test directories
//! and reads each test's profile file.

use crate::schema::{Profile, Settings};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for settings and profile loading.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Failed to read the file.
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Failed to parse YAML.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Failed to parse TOML.
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    /// No settings file in the test root.
    #[error("no yoke_config.json (or .yaml, .yml, .toml) found in {}", .0.display())]
    MissingSettings(PathBuf),
}

/// File stem of the suite settings file.
pub const SETTINGS_STEM: &str = "yoke_config";

/// File stem of a per-test profile file.
pub const PROFILE_STEM: &str = "yoke_profile";

/// Accepted extensions, in lookup order.
const EXTENSIONS: [&str; 4] = ["json", "yaml", "yml", "toml"];

/// Parse `path` according to its extension.
fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let contents = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "yaml" | "yml" => Ok(serde_yaml::from_str(&contents)?),
        "toml" => Ok(toml::from_str(&contents)?),
        _ => Ok(serde_json::from_str(&contents)?),
    }
}

/// First existing `<stem>.<ext>` in `dir`.
fn find_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|path| path.is_file())
}

/// Load the suite settings from the test root.
///
/// A missing settings file is an error.
pub fn load_settings(root: &Path) -> Result<Settings, LoadError> {
    let path = find_file(root, SETTINGS_STEM)
        .ok_or_else(|| LoadError::MissingSettings(root.to_path_buf()))?;
    tracing::debug!(path = %path.display(), "loading settings");
    load_file(&path)
}

/// Load a test's profile from its directory.
///
/// Returns `None` if the directory has no profile file, `Err` if it has one
/// that cannot be read or parsed.
pub fn load_profile(dir: &Path) -> Result<Option<Profile>, LoadError> {
    let Some(path) = find_file(dir, PROFILE_STEM) else {
        return Ok(None);
    };
    tracing::debug!(path = %path.display(), "loading profile");
    load_file(&path).map(Some)
}

/// Find the test directories under `root` whose names start with `prefix`.
///
/// Returns directory names sorted, which is the discovery order.
pub fn find_tests(root: &Path, prefix: &str) -> Result<Vec<String>, std::io::Error> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(prefix)
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_json_settings() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("yoke_config.json"),
            r#"{
                "defaultProfile": {
                    "name": "default",
                    "stdout": "stdout.txt",
                    "pass": { "zeroExit": true }
                },
                "maxthreads": 4,
                "prefix": "t"
            }"#,
        )
        .unwrap();

        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.max_threads, 4);
        assert_eq!(settings.prefix, "t");
        assert_eq!(settings.default_profile.name.as_deref(), Some("default"));
        assert_eq!(
            settings.default_profile.pass.unwrap().zero_exit,
            Some(true)
        );
    }

    #[test]
    fn load_yaml_settings() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("yoke_config.yaml"),
            r#"
defaultProfile:
  command: ./run.sh
  maxTimePerCommand: 2.5
maxthreads: 2
"#,
        )
        .unwrap();

        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.max_threads, 2);
        assert_eq!(settings.prefix, "");
        assert_eq!(settings.default_profile.max_time_per_command, Some(2.5));
    }

    #[test]
    fn load_toml_settings() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("yoke_config.toml"),
            r#"
maxthreads = 3

[defaultProfile]
command = "./run.sh"
limitOutput = 100
"#,
        )
        .unwrap();

        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.max_threads, 3);
        assert_eq!(settings.default_profile.limit_output, Some(100));
    }

    #[test]
    fn json_settings_take_precedence() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("yoke_config.json"), r#"{"maxthreads": 1}"#).unwrap();
        std::fs::write(dir.path().join("yoke_config.yaml"), "maxthreads: 9").unwrap();

        assert_eq!(load_settings(dir.path()).unwrap().max_threads, 1);
    }

    #[test]
    fn missing_settings_is_an_error() {
        let dir = tempdir().unwrap();
        let result = load_settings(dir.path());
        assert!(matches!(result, Err(LoadError::MissingSettings(_))));
    }

    #[test]
    fn invalid_settings() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("yoke_config.json"), "{ \"maxthreads\": ").unwrap();
        assert!(matches!(
            load_settings(dir.path()),
            Err(LoadError::Json(_))
        ));
    }

    #[test]
    fn load_profile_not_found() {
        let dir = tempdir().unwrap();
        assert!(load_profile(dir.path()).unwrap().is_none());
    }

    #[test]
    fn load_profile_with_chain() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("yoke_profile.json"),
            r#"{
                "command": "./first.sh",
                "pass": { "match": [["out", "expected"]] },
                "next": { "command": "./second.sh" }
            }"#,
        )
        .unwrap();

        let profile = load_profile(dir.path()).unwrap().unwrap();
        assert_eq!(profile.command.as_deref(), Some("./first.sh"));
        assert_eq!(
            profile.next.unwrap().command.as_deref(),
            Some("./second.sh")
        );
    }

    #[test]
    fn load_invalid_yaml_profile() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("yoke_profile.yaml"), "invalid: [yaml: {").unwrap();
        assert!(matches!(load_profile(dir.path()), Err(LoadError::Yaml(_))));
    }

    #[test]
    fn load_invalid_toml_profile() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("yoke_profile.toml"), "command = [toml").unwrap();
        assert!(matches!(load_profile(dir.path()), Err(LoadError::Toml(_))));
    }

    #[test]
    fn find_tests_filters_by_prefix_and_sorts() {
        let dir = tempdir().unwrap();
        for name in ["t2", "t10", "t1", "other"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("t3"), "a file, not a test").unwrap();

        assert_eq!(find_tests(dir.path(), "t").unwrap(), ["t1", "t10", "t2"]);
        assert_eq!(find_tests(dir.path(), "").unwrap().len(), 4);
    }

    #[test]
    fn error_messages() {
        let err = LoadError::MissingSettings(PathBuf::from("/suite"));
        assert_eq!(
            err.to_string(),
            "no yoke_config.json (or .yaml, .yml, .toml) found in /suite"
        );
    }
}
