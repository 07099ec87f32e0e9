// ABOUTME: holds the administrator allow-list and decides whether an execute request may run.
// ABOUTME: tables are immutable snapshots; reload swaps in a fully built table.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use regex::Regex;
use savalet_common::ExecuteRequest;

use crate::config::{ArgPattern, CommandConfig, ConfigError, TypedArgPattern};

/// Upper bound for any configured timeout: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Decides whether a single positional argument is acceptable.
pub trait ArgMatcher: fmt::Debug + Send + Sync {
    fn matches(&self, arg: &str) -> bool;

    /// Stable human-readable form used in rejection reasons.
    fn describe(&self) -> String;
}

#[derive(Debug)]
pub struct LiteralMatcher(String);

impl ArgMatcher for LiteralMatcher {
    fn matches(&self, arg: &str) -> bool {
        arg == self.0
    }

    fn describe(&self) -> String {
        format!("literal {:?}", self.0)
    }
}

/// `*` matches any run of characters (including `/`), `?` exactly one.
#[derive(Debug)]
pub struct GlobMatcher {
    pattern: String,
    compiled: Regex,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut translated = String::from("(?s)^");
        for c in pattern.chars() {
            match c {
                '*' => translated.push_str(".*"),
                '?' => translated.push('.'),
                other => translated.push_str(&regex::escape(&other.to_string())),
            }
        }
        translated.push('$');
        Ok(GlobMatcher {
            pattern: pattern.to_string(),
            compiled: Regex::new(&translated)?,
        })
    }
}

impl ArgMatcher for GlobMatcher {
    fn matches(&self, arg: &str) -> bool {
        self.compiled.is_match(arg)
    }

    fn describe(&self) -> String {
        format!("glob {:?}", self.pattern)
    }
}

/// Always anchored: the whole argument must match.
#[derive(Debug)]
pub struct RegexMatcher {
    pattern: String,
    compiled: Regex,
}

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(RegexMatcher {
            pattern: pattern.to_string(),
            compiled: Regex::new(&format!("^(?:{pattern})$"))?,
        })
    }
}

impl ArgMatcher for RegexMatcher {
    fn matches(&self, arg: &str) -> bool {
        self.compiled.is_match(arg)
    }

    fn describe(&self) -> String {
        format!("regex {:?}", self.pattern)
    }
}

fn build_matcher(pattern: &ArgPattern) -> Result<Box<dyn ArgMatcher>, regex::Error> {
    Ok(match pattern {
        ArgPattern::Literal(s) | ArgPattern::Typed(TypedArgPattern::Literal(s)) => {
            Box::new(LiteralMatcher(s.clone()))
        }
        ArgPattern::Typed(TypedArgPattern::Glob(p)) => Box::new(GlobMatcher::new(p)?),
        ArgPattern::Typed(TypedArgPattern::Regex(p)) => Box::new(RegexMatcher::new(p)?),
    })
}

#[derive(Debug)]
pub struct CommandPolicy {
    pub name: String,
    pub program: String,
    pub matchers: Vec<Box<dyn ArgMatcher>>,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
}

impl CommandPolicy {
    fn from_config(entry: &CommandConfig) -> Result<Self, ConfigError> {
        let max_timeout_secs = entry.max_timeout.unwrap_or(entry.timeout);
        if entry.timeout == 0 {
            return Err(ConfigError::InvalidTimeout {
                name: entry.name.clone(),
                message: "timeout must be > 0".to_string(),
            });
        }
        if max_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::InvalidTimeout {
                name: entry.name.clone(),
                message: format!("timeout {max_timeout_secs} exceeds the {MAX_TIMEOUT_SECS}s ceiling"),
            });
        }
        if entry.timeout > max_timeout_secs {
            return Err(ConfigError::InvalidTimeout {
                name: entry.name.clone(),
                message: format!("timeout {} exceeds max_timeout {max_timeout_secs}", entry.timeout),
            });
        }

        let matchers = entry
            .args
            .iter()
            .enumerate()
            .map(|(index, pattern)| {
                build_matcher(pattern).map_err(|source| ConfigError::InvalidPattern {
                    name: entry.name.clone(),
                    index,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CommandPolicy {
            name: entry.name.clone(),
            program: entry.program.clone().unwrap_or_else(|| entry.name.clone()),
            matchers,
            default_timeout_secs: entry.timeout,
            max_timeout_secs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("command not allowed")]
    CommandNotAllowed,

    #[error("argument not permitted: expected at most {max} arguments, got {got}")]
    TooManyArguments { max: usize, got: usize },

    #[error("argument not permitted: argument {index} does not match {matcher}")]
    ArgumentMismatch { index: usize, matcher: String },

    #[error("timeout exceeds policy maximum: requested {requested}s, maximum {max}s")]
    TimeoutExceedsMaximum { requested: i32, max: u64 },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::CommandNotAllowed => "command_not_allowed",
            Rejection::TooManyArguments { .. } => "too_many_arguments",
            Rejection::ArgumentMismatch { .. } => "argument_mismatch",
            Rejection::TimeoutExceedsMaximum { .. } => "timeout_exceeds_maximum",
        }
    }
}

/// A request that passed validation, with the policy decisions already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub command: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Default)]
pub struct AllowListTable {
    policies: HashMap<String, CommandPolicy>,
}

impl AllowListTable {
    pub fn from_config(entries: &[CommandConfig]) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::NoCommands);
        }

        let mut policies = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::EmptyName { index });
            }
            if policies.contains_key(&entry.name) {
                return Err(ConfigError::DuplicateCommand(entry.name.clone()));
            }
            policies.insert(entry.name.clone(), CommandPolicy::from_config(entry)?);
        }
        Ok(AllowListTable { policies })
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandPolicy> {
        self.policies.get(name)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn validate(&self, request: &ExecuteRequest) -> Result<Accepted, Rejection> {
        let policy = self
            .lookup(&request.command)
            .ok_or(Rejection::CommandNotAllowed)?;

        if request.args.len() > policy.matchers.len() {
            return Err(Rejection::TooManyArguments {
                max: policy.matchers.len(),
                got: request.args.len(),
            });
        }
        for (index, (arg, matcher)) in request.args.iter().zip(&policy.matchers).enumerate() {
            if !matcher.matches(arg) {
                return Err(Rejection::ArgumentMismatch {
                    index,
                    matcher: matcher.describe(),
                });
            }
        }

        let timeout_secs = if request.timeout <= 0 {
            policy.default_timeout_secs
        } else if request.timeout as u64 > policy.max_timeout_secs {
            return Err(Rejection::TimeoutExceedsMaximum {
                requested: request.timeout,
                max: policy.max_timeout_secs,
            });
        } else {
            request.timeout as u64
        };

        Ok(Accepted {
            command: policy.name.clone(),
            program: policy.program.clone(),
            args: request.args.clone(),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// The live allow-list: one shared reference to the current table, replaced wholesale on reload.
#[derive(Debug)]
pub struct AllowList {
    current: RwLock<Arc<AllowListTable>>,
}

impl AllowList {
    pub fn new(table: AllowListTable) -> Self {
        AllowList {
            current: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<AllowListTable> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    pub fn replace(&self, table: AllowListTable) {
        let next = Arc::new(table);
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    fn table(toml: &str) -> AllowListTable {
        let config = DaemonConfig::parse(toml).unwrap();
        AllowListTable::from_config(&config.commands).unwrap()
    }

    fn request(command: &str, args: &[&str], timeout: i32) -> ExecuteRequest {
        ExecuteRequest {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout,
        }
    }

    const POLICY: &str = r#"
[[commands]]
name = "systemctl"
program = "/usr/bin/systemctl"
args = ["status", { glob = "*.service" }]
timeout = 10
max_timeout = 60

[[commands]]
name = "journalctl"
args = ["-n", { regex = "[0-9]{1,4}" }]
timeout = 5
"#;

    #[test]
    fn unknown_command_is_not_allowed() {
        let t = table(POLICY);
        let err = t.validate(&request("rm", &["-rf", "/"], 0)).unwrap_err();
        assert_eq!(err, Rejection::CommandNotAllowed);
        assert_eq!(err.to_string(), "command not allowed");
    }

    #[test]
    fn lookup_is_exact_name_match() {
        let t = table(POLICY);
        assert!(t.lookup("systemctl").is_some());
        assert!(t.lookup("/usr/bin/systemctl").is_none());
        assert!(t.lookup("SYSTEMCTL").is_none());
    }

    #[test]
    fn accepts_matching_args_and_resolves_program() {
        let t = table(POLICY);
        let accepted = t.validate(&request("systemctl", &["status", "ssh.service"], 20)).unwrap();
        assert_eq!(accepted.program, "/usr/bin/systemctl");
        assert_eq!(accepted.args, vec!["status", "ssh.service"]);
        assert_eq!(accepted.timeout, Duration::from_secs(20));
    }

    #[test]
    fn fewer_args_than_matchers_is_accepted() {
        let t = table(POLICY);
        assert!(t.validate(&request("systemctl", &["status"], 0)).is_ok());
    }

    #[test]
    fn too_many_args_is_rejected() {
        let t = table(POLICY);
        let err = t
            .validate(&request("systemctl", &["status", "ssh.service", "--now"], 0))
            .unwrap_err();
        assert_eq!(err, Rejection::TooManyArguments { max: 2, got: 3 });
        assert_eq!(
            err.to_string(),
            "argument not permitted: expected at most 2 arguments, got 3"
        );
    }

    #[test]
    fn mismatched_literal_names_the_matcher() {
        let t = table(POLICY);
        let err = t.validate(&request("systemctl", &["stop", "ssh.service"], 0)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument not permitted: argument 0 does not match literal \"status\""
        );
        assert_eq!(err.code(), "argument_mismatch");
    }

    #[test]
    fn glob_does_not_match_other_suffixes() {
        let t = table(POLICY);
        let err = t.validate(&request("systemctl", &["status", "ssh.socket"], 0)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument not permitted: argument 1 does not match glob \"*.service\""
        );
    }

    #[test]
    fn regex_is_anchored() {
        let t = table(POLICY);
        assert!(t.validate(&request("journalctl", &["-n", "100"], 0)).is_ok());
        let err = t.validate(&request("journalctl", &["-n", "100; reboot"], 0)).unwrap_err();
        assert_eq!(
            err,
            Rejection::ArgumentMismatch {
                index: 1,
                matcher: "regex \"[0-9]{1,4}\"".to_string()
            }
        );
    }

    #[test]
    fn non_positive_timeout_uses_policy_default() {
        let t = table(POLICY);
        for requested in [0, -1, i32::MIN] {
            let accepted = t.validate(&request("systemctl", &[], requested)).unwrap();
            assert_eq!(accepted.timeout, Duration::from_secs(10));
        }
    }

    #[test]
    fn timeout_above_maximum_is_rejected() {
        let t = table(POLICY);
        let err = t.validate(&request("journalctl", &[], 6)).unwrap_err();
        assert_eq!(err, Rejection::TimeoutExceedsMaximum { requested: 6, max: 5 });
        assert!(err.to_string().starts_with("timeout exceeds policy maximum"));
        assert!(t.validate(&request("journalctl", &[], 5)).is_ok());
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let m = GlobMatcher::new("a.b?[x]").unwrap();
        assert!(m.matches("a.bZ[x]"));
        assert!(!m.matches("aXbZ[x]"));
        assert!(!m.matches("a.b[x]"));
    }

    #[test]
    fn empty_allow_list_is_a_load_error() {
        let err = AllowListTable::from_config(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::NoCommands));
    }

    #[test]
    fn duplicate_names_are_a_load_error() {
        let config = DaemonConfig::parse("[[commands]]\nname = \"ls\"\n[[commands]]\nname = \"ls\"\n").unwrap();
        let err = AllowListTable::from_config(&config.commands).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCommand(name) if name == "ls"));
    }

    #[test]
    fn default_above_maximum_is_a_load_error() {
        let config =
            DaemonConfig::parse("[[commands]]\nname = \"ls\"\ntimeout = 10\nmax_timeout = 5\n").unwrap();
        let err = AllowListTable::from_config(&config.commands).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeout { .. }));
    }

    #[test]
    fn timeouts_beyond_the_ceiling_are_a_load_error() {
        for toml in [
            "[[commands]]\nname = \"ls\"\ntimeout = 9223372036854775807\n",
            "[[commands]]\nname = \"ls\"\ntimeout = 5\nmax_timeout = 9223372036854775807\n",
        ] {
            let config = DaemonConfig::parse(toml).unwrap();
            let err = AllowListTable::from_config(&config.commands).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidTimeout { .. }), "{toml}");
        }

        let at_ceiling = format!("[[commands]]\nname = \"ls\"\nmax_timeout = {MAX_TIMEOUT_SECS}\n");
        let t = table(&at_ceiling);
        let err = t.validate(&request("ls", &[], i32::MAX)).unwrap_err();
        assert!(matches!(err, Rejection::TimeoutExceedsMaximum { .. }));
        assert!(t.validate(&request("ls", &[], MAX_TIMEOUT_SECS as i32)).is_ok());
    }

    #[test]
    fn invalid_regex_is_a_load_error() {
        let config = DaemonConfig::parse("[[commands]]\nname = \"ls\"\nargs = [{ regex = \"(\" }]\n").unwrap();
        let err = AllowListTable::from_config(&config.commands).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { index: 0, .. }));
    }

    #[test]
    fn replace_swaps_whole_table_and_keeps_old_snapshots() {
        let allow_list = AllowList::new(table(POLICY));
        let before = allow_list.snapshot();

        allow_list.replace(table("[[commands]]\nname = \"uptime\"\n"));

        let after = allow_list.snapshot();
        assert!(before.lookup("systemctl").is_some());
        assert!(after.lookup("systemctl").is_none());
        assert_eq!(after.names(), vec!["uptime"]);
    }
}
