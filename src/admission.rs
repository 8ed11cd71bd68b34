//! Query admission rules consumed by the HTTP front door.
//!
//! Three regex sets are compiled at startup. By convention the
//! create-database pattern is the last clustered entry.

use crate::Result;
use regex::Regex;

/// Statements the proxy refuses outright.
const FORBIDDEN_PATTERNS: &[&str] = &[
    r"(?i)^\s*grant\b",
    r"(?i)^\s*revoke\b",
    r"(?i)^\s*kill\b",
    r"(?i)^\s*drop\s+database\b",
    r"(?i)\binto\b",
];

/// Statements a measurement query must match to be dispatched.
const OBLIGATED_PATTERNS: &[&str] = &[r"(?i)^\s*(select|show)\b"];

/// Cluster-scope statements; the create-database pattern stays last.
const CLUSTERED_PATTERNS: &[&str] = &[
    r"(?i)^\s*show\s+databases\b",
    r"(?i)^\s*show\s+retention\s+policies\b",
    r"(?i)^\s*drop\s+measurement\b",
    r"(?i)^\s*create\s+database\b",
];

/// Compiled admission rule sets.
#[derive(Debug)]
pub struct QueryGate {
    forbidden: Vec<Regex>,
    obligated: Vec<Regex>,
    clustered: Vec<Regex>,
}

impl QueryGate {
    pub fn new(forbidden: &[&str], obligated: &[&str], clustered: &[&str]) -> Result<Self> {
        Ok(Self {
            forbidden: compile(forbidden)?,
            obligated: compile(obligated)?,
            clustered: compile(clustered)?,
        })
    }

    /// The built-in rule sets.
    pub fn default_rules() -> Self {
        Self::new(FORBIDDEN_PATTERNS, OBLIGATED_PATTERNS, CLUSTERED_PATTERNS)
            .expect("built-in admission patterns compile")
    }

    /// A measurement query passes when no forbidden pattern matches and, if
    /// the obligated set is non-empty, some obligated pattern matches.
    pub fn check_measurement_query(&self, q: &str) -> bool {
        if self.forbidden.iter().any(|r| r.is_match(q)) {
            return false;
        }
        self.obligated.is_empty() || self.obligated.iter().any(|r| r.is_match(q))
    }

    /// A cluster query passes when the clustered set is empty or some
    /// clustered pattern matches.
    pub fn check_cluster_query(&self, q: &str) -> bool {
        self.clustered.is_empty() || self.clustered.iter().any(|r| r.is_match(q))
    }

    /// Create-database is recognized by the last clustered pattern.
    pub fn check_create_database_query(&self, q: &str) -> bool {
        match self.clustered.last() {
            Some(r) => r.is_match(q),
            None => false,
        }
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| Ok(Regex::new(p)?)).collect()
}
