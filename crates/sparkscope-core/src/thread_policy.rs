//! Thread selection and grouping policies.
//!
//! [`ThreadCapturePolicy`] decides *which* threads a sampler snapshots;
//! [`ThreadGrouping`] decides which call tree a captured stack is merged into.
//! Both are closed sets of variants with no shared mutable state.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Capture policy
// =============================================================================

/// Which threads are captured on each sampling tick.
#[derive(Debug, Clone)]
pub enum ThreadCapturePolicy {
    /// Every live thread.
    All,
    /// Exact, case-insensitive name match. Names are stored lowercased.
    Specific(BTreeSet<String>),
    /// Any pattern matches (OR semantics), case-insensitive.
    Regex(Vec<Regex>),
    /// The platform's designated main-loop thread.
    PrimaryThread(String),
}

impl ThreadCapturePolicy {
    /// Build a `Specific` policy from thread names.
    pub fn specific<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Specific(
            names
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        )
    }

    /// Build a `Regex` policy. Fails with `InvalidConfiguration` on the first
    /// pattern that does not compile, or when no patterns are given.
    pub fn regex<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        Error::InvalidConfiguration(format!(
                            "invalid thread pattern '{}': {e}",
                            p.as_ref()
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        if compiled.is_empty() {
            return Err(Error::InvalidConfiguration(
                "regex thread policy needs at least one pattern".to_string(),
            ));
        }
        Ok(Self::Regex(compiled))
    }

    /// Policy for the operator's `--thread` arguments: none selects the
    /// primary thread, `*` selects everything, otherwise names or patterns.
    pub fn from_selection(names: &[String], use_regex: bool, primary: &str) -> Result<Self> {
        if names.is_empty() {
            return Ok(Self::PrimaryThread(primary.to_string()));
        }
        if names.iter().any(|n| n == "*") {
            return Ok(Self::All);
        }
        if use_regex {
            Self::regex(names)
        } else {
            Ok(Self::specific(names))
        }
    }

    /// Whether a thread with this name should be captured.
    #[must_use]
    pub fn matches(&self, thread_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Specific(names) => names.contains(&thread_name.to_lowercase()),
            Self::Regex(patterns) => patterns.iter().any(|p| p.is_match(thread_name)),
            Self::PrimaryThread(primary) => thread_name.eq_ignore_ascii_case(primary),
        }
    }

    /// Human-readable label recorded in session metadata.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Specific(names) => {
                format!("specific: {}", names.iter().cloned().collect::<Vec<_>>().join(", "))
            }
            Self::Regex(patterns) => format!(
                "regex: {}",
                patterns
                    .iter()
                    .map(Regex::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::PrimaryThread(name) => format!("primary: {name}"),
        }
    }
}

impl fmt::Display for ThreadCapturePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

// =============================================================================
// Grouping
// =============================================================================

/// Key used for every stack under [`ThreadGrouping::AsOne`].
pub const COMBINED_GROUP_KEY: &str = "All";

/// `Worker-12`, `pool#3`, `Netty Epoll #1` all end in an index suffix.
static POOL_SUFFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.*?)[-#] ?\d+$").ok());

/// How captured stacks are keyed into call trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadGrouping {
    /// Everything merges into one tree.
    AsOne,
    /// One tree per literal thread name.
    ByThreadName,
    /// Pooled workers share a tree (`Worker-3` and `Worker-7` become `Worker`).
    #[default]
    ByPoolName,
}

impl ThreadGrouping {
    /// Derive the group key for a thread name.
    #[must_use]
    pub fn group_key(self, thread_name: &str) -> String {
        match self {
            Self::AsOne => COMBINED_GROUP_KEY.to_string(),
            Self::ByThreadName => thread_name.to_string(),
            Self::ByPoolName => pool_name(thread_name).to_string(),
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::AsOne => "as one",
            Self::ByThreadName => "by name",
            Self::ByPoolName => "by pool",
        }
    }
}

impl fmt::Display for ThreadGrouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Strip a trailing worker-index suffix; names without one are returned as-is.
#[must_use]
pub fn pool_name(thread_name: &str) -> &str {
    let Some(re) = POOL_SUFFIX.as_ref() else {
        return thread_name;
    };
    match re.captures(thread_name).and_then(|c| c.get(1)) {
        Some(prefix) => {
            let trimmed = prefix.as_str().trim();
            if trimmed.is_empty() {
                thread_name
            } else {
                trimmed
            }
        }
        None => thread_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_matches_everything() {
        let policy = ThreadCapturePolicy::All;
        assert!(policy.matches("main"));
        assert!(policy.matches(""));
        assert_eq!(policy.label(), "all");
    }

    #[test]
    fn specific_is_case_insensitive_exact() {
        let policy = ThreadCapturePolicy::specific(["Server Thread", "Worker-1"]);
        assert!(policy.matches("server thread"));
        assert!(policy.matches("WORKER-1"));
        assert!(!policy.matches("Worker-10"));
        assert!(!policy.matches("Server"));
    }

    #[test]
    fn regex_uses_or_semantics() {
        let policy = ThreadCapturePolicy::regex(["^netty", "worker-\\d+$"]).unwrap();
        assert!(policy.matches("Netty Epoll #2"));
        assert!(policy.matches("Worker-7"));
        assert!(!policy.matches("main"));
        assert_eq!(policy.label(), "regex: ^netty, worker-\\d+$");
    }

    #[test]
    fn invalid_regex_is_invalid_configuration() {
        let err = ThreadCapturePolicy::regex(["(unclosed"]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        let err = ThreadCapturePolicy::regex(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn primary_thread_matches_designated_name() {
        let policy = ThreadCapturePolicy::PrimaryThread("main".to_string());
        assert!(policy.matches("Main"));
        assert!(!policy.matches("main-2"));
        assert_eq!(policy.to_string(), "primary: main");
    }

    #[test]
    fn selection_from_operator_arguments() {
        let primary = ThreadCapturePolicy::from_selection(&[], false, "main").unwrap();
        assert!(matches!(primary, ThreadCapturePolicy::PrimaryThread(_)));

        let all =
            ThreadCapturePolicy::from_selection(&["*".to_string()], false, "main").unwrap();
        assert!(matches!(all, ThreadCapturePolicy::All));

        let named =
            ThreadCapturePolicy::from_selection(&["io".to_string()], false, "main").unwrap();
        assert!(matches!(named, ThreadCapturePolicy::Specific(_)));

        let patterned =
            ThreadCapturePolicy::from_selection(&["io.*".to_string()], true, "main").unwrap();
        assert!(matches!(patterned, ThreadCapturePolicy::Regex(_)));
    }

    #[test]
    fn pool_grouping_strips_index_suffix() {
        let g = ThreadGrouping::ByPoolName;
        assert_eq!(g.group_key("Worker-12"), "Worker");
        assert_eq!(g.group_key("Worker-7"), "Worker");
        assert_eq!(g.group_key("MainThread"), "MainThread");
        assert_eq!(g.group_key("Netty Epoll #1"), "Netty Epoll");
        assert_eq!(g.group_key("pool-2-thread-14"), "pool-2-thread");
        assert_eq!(g.group_key("Thread2"), "Thread2");
    }

    #[test]
    fn pool_grouping_keeps_bare_index_names() {
        // nothing left after stripping
        assert_eq!(pool_name("-3"), "-3");
    }

    #[test]
    fn as_one_and_by_name() {
        assert_eq!(ThreadGrouping::AsOne.group_key("anything"), COMBINED_GROUP_KEY);
        assert_eq!(ThreadGrouping::ByThreadName.group_key("Worker-3"), "Worker-3");
    }

    #[test]
    fn grouping_serde_names() {
        let json = serde_json::to_string(&ThreadGrouping::ByPoolName).unwrap();
        assert_eq!(json, "\"by_pool_name\"");
        let parsed: ThreadGrouping = serde_json::from_str("\"as_one\"").unwrap();
        assert_eq!(parsed, ThreadGrouping::AsOne);
    }
}
