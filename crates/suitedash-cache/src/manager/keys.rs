//! Cache key naming scheme.
//!
//! Key formats:
//!
//! - entity: `suite:42`
//! - list: `suites:list:skip:0:limit:50`, followed by `:<filter>:<value>`
//!   pairs in ascending filter-name order
//! - aggregate: `dashboard:stats`, or `dashboard:stats:window:7d`
//! - memoized call: `memo:<name>:<sha256 prefix of the encoded arguments>`
//!
//! Equivalent queries always serialize to the same key.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Hex characters kept from a SHA-256 digest (128 bits).
const HASH_HEX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Suite,
    TestCase,
    TestRun,
    User,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Suite => "suite",
            EntityKind::TestCase => "test_case",
            EntityKind::TestRun => "test_run",
            EntityKind::User => "user",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            EntityKind::Project => "projects",
            EntityKind::Suite => "suites",
            EntityKind::TestCase => "test_cases",
            EntityKind::TestRun => "test_runs",
            EntityKind::User => "users",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pagination plus optional filter dimensions for a list query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub skip: u64,
    pub limit: u64,
    pub filters: BTreeMap<String, String>,
}

impl ListQuery {
    pub fn new(skip: u64, limit: u64) -> Self {
        Self {
            skip,
            limit,
            filters: BTreeMap::new(),
        }
    }

    /// Add a filter dimension. Empty values are ignored so "no filter" and
    /// "empty filter" share a key.
    pub fn filter(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.filters.insert(name.into(), value);
        }
        self
    }
}

/// Dashboard views computed from many rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregate {
    DashboardStats,
    RecentRuns,
    PassRateTrend,
    SuiteSummary,
}

impl Aggregate {
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregate::DashboardStats => "stats",
            Aggregate::RecentRuns => "recent_runs",
            Aggregate::PassRateTrend => "pass_rate_trend",
            Aggregate::SuiteSummary => "suite_summary",
        }
    }
}

/// Prefix shared by every aggregate key.
pub const AGGREGATE_PREFIX: &str = "dashboard";

/// Prefix shared by every memoized-call key.
pub const MEMO_PREFIX: &str = "memo";

pub fn entity_key(kind: EntityKind, id: impl fmt::Display) -> String {
    format!("{}:{id}", kind.as_str())
}

pub fn list_key(kind: EntityKind, query: &ListQuery) -> String {
    let mut key = format!(
        "{}:list:skip:{}:limit:{}",
        kind.plural(),
        query.skip,
        query.limit
    );
    for (name, value) in &query.filters {
        key.push(':');
        push_segment(&mut key, name);
        key.push(':');
        push_segment(&mut key, value);
    }
    key
}

/// Appends a filter name or value with `\` and `:` escaped, so a separator
/// inside a segment can never shift the segment boundaries.
fn push_segment(key: &mut String, segment: &str) {
    for c in segment.chars() {
        if c == ':' || c == '\\' {
            key.push('\\');
        }
        key.push(c);
    }
}

/// Pattern covering every list key of an entity type.
pub fn list_pattern(kind: EntityKind) -> String {
    format!("{}:list:*", kind.plural())
}

pub fn aggregate_key(aggregate: Aggregate, window: Option<&str>) -> String {
    match window {
        Some(window) => format!("{AGGREGATE_PREFIX}:{}:window:{window}", aggregate.as_str()),
        None => format!("{AGGREGATE_PREFIX}:{}", aggregate.as_str()),
    }
}

pub fn aggregate_pattern() -> String {
    format!("{AGGREGATE_PREFIX}:*")
}

/// Hex SHA-256 prefix of arbitrary bytes, for fixed-length key segments.
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_HEX_LEN);
    hex
}

/// Key for a memoized call: the operation name plus a hash of its
/// JSON-encoded arguments.
///
/// Argument types must serialize deterministically (structs, sequences,
/// `BTreeMap`); a `HashMap` argument can produce different keys for equal
/// values.
pub fn memo_key<A: Serialize + ?Sized>(name: &str, args: &A) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(args)?;
    let mut input = Vec::with_capacity(name.len() + 1 + encoded.len());
    input.extend_from_slice(name.as_bytes());
    input.push(0);
    input.extend_from_slice(&encoded);
    Ok(format!("{MEMO_PREFIX}:{name}:{}", short_hash(&input)))
}
