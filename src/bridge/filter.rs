//! Message filtering with keyword sets and regex patterns.
//!
//! Decides whether a normalized message is relayed. Exclusion rules are
//! always evaluated before inclusion rules, so a message that matches both
//! an exclude and an include keyword is rejected.

use std::fmt;

use fancy_regex::Regex;
use tracing::warn;

use crate::common::messages::InboundEvent;
use crate::common::types::ForwardTask;
use crate::config::types::FiltersConfig;

/// Outcome of evaluating a message against the filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject(RejectReason),
}

/// Why a message was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    IgnoredUser(String),
    ContentType(String),
    Pattern(String),
    ExcludedKeyword(String),
    MissingKeyword,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IgnoredUser(user) => write!(f, "filtered: author '{}' is ignored", user),
            Self::ContentType(kind) => write!(f, "filtered: content type '{}' not forwarded", kind),
            Self::Pattern(pattern) => write!(f, "filtered: matches pattern '{}'", pattern),
            Self::ExcludedKeyword(keyword) => write!(f, "filtered: contains excluded keyword '{}'", keyword),
            Self::MissingKeyword => write!(f, "filtered: contains none of the required keywords"),
        }
    }
}

/// Message filter built from the `filters` config section.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    patterns: Vec<CompiledPattern>,
    ignore_users: Vec<String>,
    media_types: Vec<String>,
}

/// A compiled regex pattern with its original string for debugging.
#[derive(Debug, Clone)]
struct CompiledPattern {
    original: String,
    regex: Regex,
}

impl MessageFilter {
    /// Create a filter from configuration.
    ///
    /// Invalid regex patterns are logged and skipped.
    pub fn new(config: &FiltersConfig) -> Self {
        Self {
            include: lowercase_all(&config.include),
            exclude: lowercase_all(&config.exclude),
            patterns: compile_patterns(&config.patterns),
            ignore_users: config
                .ignore_users
                .iter()
                .map(|u| u.trim_start_matches('@').to_lowercase())
                .collect(),
            media_types: lowercase_all(&config.media_types),
        }
    }

    /// Evaluate a task together with the event it was normalized from.
    ///
    /// Keywords and patterns run against the source text: the message body,
    /// or the caption for media messages.
    pub fn evaluate(&self, task: &ForwardTask, source: &InboundEvent) -> FilterDecision {
        match self.first_rejection(task, source) {
            Some(reason) => FilterDecision::Reject(reason),
            None => FilterDecision::Accept,
        }
    }

    fn first_rejection(&self, task: &ForwardTask, source: &InboundEvent) -> Option<RejectReason> {
        if let Some(user) = self.ignored_author(source) {
            return Some(RejectReason::IgnoredUser(user));
        }

        let content_type = source.content_type.name().to_lowercase();
        if !self.media_types.is_empty() && !self.media_types.contains(&content_type) {
            return Some(RejectReason::ContentType(content_type));
        }

        let text = source
            .text
            .as_deref()
            .unwrap_or_else(|| task.payload.filter_text());

        if let Some(pattern) = self.patterns.iter().find(|p| {
            p.regex.is_match(text).unwrap_or_else(|e| {
                warn!("Regex match error for pattern '{}': {}", p.original, e);
                false
            })
        }) {
            return Some(RejectReason::Pattern(pattern.original.clone()));
        }

        let lowered = text.to_lowercase();
        if let Some(keyword) = self.exclude.iter().find(|k| lowered.contains(k.as_str())) {
            return Some(RejectReason::ExcludedKeyword(keyword.clone()));
        }

        if !self.include.is_empty() && !self.include.iter().any(|k| lowered.contains(k.as_str())) {
            return Some(RejectReason::MissingKeyword);
        }

        None
    }

    fn ignored_author(&self, source: &InboundEvent) -> Option<String> {
        if self.ignore_users.is_empty() {
            return None;
        }
        if let Some(author) = &source.author {
            let name = author.trim_start_matches('@').to_lowercase();
            if self.ignore_users.contains(&name) {
                return Some(author.clone());
            }
        }
        if let Some(id) = source.author_id {
            let id = id.to_string();
            if self.ignore_users.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Returns true if any rule is configured.
    pub fn has_rules(&self) -> bool {
        !self.include.is_empty()
            || !self.exclude.is_empty()
            || !self.patterns.is_empty()
            || !self.ignore_users.is_empty()
            || !self.media_types.is_empty()
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Compile a list of regex pattern strings, skipping invalid ones.
fn compile_patterns(patterns: &[String]) -> Vec<CompiledPattern> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(CompiledPattern {
                original: pattern.clone(),
                regex,
            }),
            Err(e) => {
                warn!("Invalid filter regex pattern '{}': {}", pattern, e);
                None
            }
        })
        .collect()
}
