//! Profile resolution.
//!
//! A test's profile is merged field-by-field against the default profile and
//! its `next` links are flattened into an ordered list of steps before any
//! command runs.

use crate::schema::{PassConditions, Profile};
use thiserror::Error;

/// Problems with a test's configuration that are detected before it runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Following `next` links led back to a step already in the chain.
    #[error("profile chain is cyclic: step {step} links back to an earlier step")]
    CyclicChain { step: usize },
}

impl Profile {
    /// Fill every unset field from `defaults`.
    ///
    /// Pass conditions resolve per condition; the `match` and `rmatch` rule
    /// lists are inherited as whole lists.
    pub fn resolve(&self, defaults: &Profile) -> Profile {
        Profile {
            name: self.name.clone().or_else(|| defaults.name.clone()),
            before: self.before.clone().or_else(|| defaults.before.clone()),
            command: self.command.clone().or_else(|| defaults.command.clone()),
            after: self.after.clone().or_else(|| defaults.after.clone()),
            stdin: self.stdin.clone().or_else(|| defaults.stdin.clone()),
            stdout: self.stdout.clone().or_else(|| defaults.stdout.clone()),
            stderr: self.stderr.clone().or_else(|| defaults.stderr.clone()),
            limit_output: self.limit_output.or(defaults.limit_output),
            max_time_per_command: self.max_time_per_command.or(defaults.max_time_per_command),
            required_files: self
                .required_files
                .clone()
                .or_else(|| defaults.required_files.clone()),
            create_required: self.create_required.or(defaults.create_required),
            noconcurrent: self.noconcurrent.or(defaults.noconcurrent),
            pass: match (&self.pass, &defaults.pass) {
                (Some(own), Some(inherited)) => Some(own.resolve(inherited)),
                (own, inherited) => own.clone().or_else(|| inherited.clone()),
            },
            next: self.next.clone().or_else(|| defaults.next.clone()),
        }
    }

    /// The link followed after this step: its own `next`, else the default's.
    fn next_link<'a>(&'a self, defaults: &'a Profile) -> Option<&'a Profile> {
        self.next.as_deref().or(defaults.next.as_deref())
    }

    /// Display name used in diagnostics.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }

    /// Whether the test must run outside the concurrent group.
    pub fn is_noconcurrent(&self) -> bool {
        self.noconcurrent.unwrap_or(false)
    }

    /// Render the profile as pretty-printed JSON for diagnostics.
    pub fn render(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:#?}"))
    }
}

impl PassConditions {
    /// Fill every unset condition from `defaults`.
    pub fn resolve(&self, defaults: &PassConditions) -> PassConditions {
        PassConditions {
            zero_exit: self.zero_exit.or(defaults.zero_exit),
            match_rules: self
                .match_rules
                .clone()
                .or_else(|| defaults.match_rules.clone()),
            rmatch_rules: self
                .rmatch_rules
                .clone()
                .or_else(|| defaults.rmatch_rules.clone()),
            limit_reached: self.limit_reached.or(defaults.limit_reached),
            max_time_per_command_reached: self
                .max_time_per_command_reached
                .or(defaults.max_time_per_command_reached),
        }
    }
}

/// The steps of a test, in execution order.
#[derive(Debug)]
pub struct Chain {
    /// Resolved steps. Each step's `next` is cleared.
    pub steps: Vec<Profile>,
    /// Set when flattening stopped at a cycle; `steps` holds the acyclic prefix.
    pub error: Option<ConfigError>,
}

/// Resolve `root` and every step reachable through `next` links against `defaults`.
///
/// A step without its own `next` inherits the default's link, so a default
/// profile with a `next` step revisits that same step forever. Revisiting any
/// link stops the walk with [`ConfigError::CyclicChain`].
pub fn flatten_chain(root: &Profile, defaults: &Profile) -> Chain {
    let mut visited: Vec<&Profile> = Vec::new();
    let mut steps = Vec::new();
    let mut current = Some(root);

    while let Some(link) = current {
        if visited.iter().any(|seen| std::ptr::eq(*seen, link)) {
            return Chain {
                error: Some(ConfigError::CyclicChain { step: steps.len() }),
                steps,
            };
        }
        visited.push(link);

        let mut step = link.resolve(defaults);
        step.next = None;
        steps.push(step);

        current = link.next_link(defaults);
    }

    Chain { steps, error: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Profile {
        Profile {
            name: Some("default".to_string()),
            command: Some("./default.sh".to_string()),
            stdout: Some("out.txt".to_string()),
            limit_output: Some(1024),
            max_time_per_command: Some(5.0),
            create_required: Some(true),
            pass: Some(PassConditions {
                zero_exit: Some(true),
                match_rules: Some(vec![vec!["out.txt".to_string(), "want.txt".to_string()]]),
                limit_reached: Some(false),
                ..PassConditions::default()
            }),
            ..Profile::default()
        }
    }

    #[test]
    fn unset_fields_come_from_defaults() {
        let own = Profile {
            command: Some("./own.sh".to_string()),
            ..Profile::default()
        };
        let resolved = own.resolve(&defaults());

        assert_eq!(resolved.command.as_deref(), Some("./own.sh"));
        assert_eq!(resolved.name.as_deref(), Some("default"));
        assert_eq!(resolved.stdout.as_deref(), Some("out.txt"));
        assert_eq!(resolved.limit_output, Some(1024));
        assert_eq!(resolved.max_time_per_command, Some(5.0));
        assert_eq!(resolved.create_required, Some(true));
        assert_eq!(resolved.pass, defaults().pass);
        assert_eq!(resolved.stderr, None);
    }

    #[test]
    fn explicit_false_overrides_default_true() {
        let own = Profile {
            create_required: Some(false),
            ..Profile::default()
        };
        assert_eq!(own.resolve(&defaults()).create_required, Some(false));
    }

    #[test]
    fn resolving_twice_is_a_no_op() {
        let own = Profile {
            stderr: Some("err.txt".to_string()),
            pass: Some(PassConditions {
                rmatch_rules: Some(vec![vec!["re".to_string(), "out.txt".to_string()]]),
                ..PassConditions::default()
            }),
            ..Profile::default()
        };
        let once = own.resolve(&defaults());
        let twice = once.resolve(&defaults());
        assert_eq!(once, twice);
    }

    #[test]
    fn pass_conditions_resolve_per_condition() {
        let own = Profile {
            pass: Some(PassConditions {
                zero_exit: Some(false),
                ..PassConditions::default()
            }),
            ..Profile::default()
        };
        let pass = own.resolve(&defaults()).pass.unwrap();

        assert_eq!(pass.zero_exit, Some(false));
        assert_eq!(pass.limit_reached, Some(false));
        assert_eq!(pass.match_rules, defaults().pass.unwrap().match_rules);
        assert_eq!(pass.max_time_per_command_reached, None);
    }

    #[test]
    fn match_rules_are_inherited_as_a_whole_list() {
        let own = Profile {
            pass: Some(PassConditions {
                match_rules: Some(vec![vec!["a".to_string(), "b".to_string()]]),
                ..PassConditions::default()
            }),
            ..Profile::default()
        };
        let pass = own.resolve(&defaults()).pass.unwrap();
        assert_eq!(
            pass.match_rules,
            Some(vec![vec!["a".to_string(), "b".to_string()]])
        );
    }

    #[test]
    fn flatten_single_step() {
        let chain = flatten_chain(&Profile::default(), &defaults());
        assert!(chain.error.is_none());
        assert_eq!(chain.steps.len(), 1);
        assert_eq!(chain.steps[0].command.as_deref(), Some("./default.sh"));
    }

    #[test]
    fn flatten_follows_next_links_in_order() {
        let root = Profile {
            command: Some("first".to_string()),
            next: Some(Box::new(Profile {
                command: Some("second".to_string()),
                next: Some(Box::new(Profile {
                    command: Some("third".to_string()),
                    ..Profile::default()
                })),
                ..Profile::default()
            })),
            ..Profile::default()
        };
        let chain = flatten_chain(&root, &defaults());

        assert!(chain.error.is_none());
        let commands: Vec<_> = chain
            .steps
            .iter()
            .map(|s| s.command.as_deref().unwrap())
            .collect();
        assert_eq!(commands, ["first", "second", "third"]);
        assert!(chain.steps.iter().all(|s| s.next.is_none()));
        assert!(chain.steps.iter().all(|s| s.stdout.as_deref() == Some("out.txt")));
    }

    #[test]
    fn inherited_next_link_is_a_cycle() {
        let mut defaults = defaults();
        defaults.next = Some(Box::new(Profile {
            command: Some("cleanup".to_string()),
            ..Profile::default()
        }));
        let root = Profile {
            command: Some("main".to_string()),
            ..Profile::default()
        };
        let chain = flatten_chain(&root, &defaults);

        assert!(matches!(
            chain.error,
            Some(ConfigError::CyclicChain { step: 2 })
        ));
        let commands: Vec<_> = chain
            .steps
            .iter()
            .map(|s| s.command.as_deref().unwrap())
            .collect();
        assert_eq!(commands, ["main", "cleanup"]);
    }

    #[test]
    fn default_profile_as_root_with_next_is_a_cycle() {
        let mut defaults = defaults();
        defaults.next = Some(Box::new(Profile::default()));
        let chain = flatten_chain(&defaults, &defaults);
        assert!(chain.error.is_some());
        assert_eq!(chain.steps.len(), 2);
    }

    #[test]
    fn cycle_error_message() {
        let err = ConfigError::CyclicChain { step: 3 };
        assert_eq!(
            err.to_string(),
            "profile chain is cyclic: step 3 links back to an earlier step"
        );
    }

    #[test]
    fn render_is_json() {
        let rendered = defaults().render();
        let parsed: Profile = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, defaults());
    }
}
