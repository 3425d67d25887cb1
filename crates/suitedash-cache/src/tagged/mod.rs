//! Tag- and dependency-aware cache.
//!
//! A second invalidation axis next to the prefix-based helpers of the
//! [`CacheManager`](crate::manager::CacheManager). Entries live under
//! `<category>:<hash of identifier>` and may carry:
//!
//! - **tags**: `tag:<name>` holds every key registered under the tag;
//!   invalidating the tag deletes them all and then the set itself
//! - **dependencies**: `deps:<key>` lists the keys an entry depends on and
//!   `rdeps:<dependency>` lists the entries depending on a key, so finding
//!   dependents is one set read
//!
//! `tags:<key>` records the tags of an entry. Together with `deps:<key>` it
//! lets a re-`set` or an invalidation withdraw the entry from every index it
//! was registered in.
//!
//! Cascades are single level: dependents of dependents are left alone.
//! Index sets and entries are written in separate store calls; an index
//! member whose entry has expired or was never written is harmless, since
//! invalidation deletes whatever the set names.

mod health;
mod stats;

use futures_util::stream::{self, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;

use crate::config::{CacheSettings, CategoryTtlConfig};
use crate::manager::keys::short_hash;
use crate::store::StoreClient;

pub use health::{HealthReport, HealthStatus};
pub use stats::CacheStats;

const TAG_PREFIX: &str = "tag";
const DEPS_PREFIX: &str = "deps";
const RDEPS_PREFIX: &str = "rdeps";
const ENTRY_TAGS_PREFIX: &str = "tags";

fn tag_key(tag: &str) -> String {
    format!("{TAG_PREFIX}:{tag}")
}

fn deps_key(key: &str) -> String {
    format!("{DEPS_PREFIX}:{key}")
}

fn rdeps_key(key: &str) -> String {
    format!("{RDEPS_PREFIX}:{key}")
}

fn entry_tags_key(key: &str) -> String {
    format!("{ENTRY_TAGS_PREFIX}:{key}")
}

/// Per-entry options for [`TaggedCache::set`].
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    /// Seconds; `None` or zero uses the category default.
    pub ttl: Option<u64>,
    pub tags: Vec<String>,
    /// Keys (as returned by [`TaggedCache::key`] or the manager's key
    /// builders) whose invalidation should also remove this entry.
    pub dependencies: Vec<String>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = Some(secs);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    /// Depend on another tagged entry.
    pub fn depends_on_entry(self, prefix: &str, identifier: impl fmt::Display) -> Self {
        self.depends_on(TaggedCache::key(prefix, identifier))
    }
}

/// Options for [`TaggedCache::warm_cache`].
#[derive(Debug, Clone)]
pub struct WarmOptions {
    /// Category the warmed entries are stored under.
    pub prefix: String,
    pub ttl: Option<u64>,
    pub tags: Vec<String>,
    /// Maximum concurrent writes.
    pub concurrency: usize,
}

impl WarmOptions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ttl: None,
            tags: Vec::new(),
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub attempted: usize,
    pub stored: usize,
}

#[derive(Clone)]
pub struct TaggedCache {
    store: StoreClient,
    categories: CategoryTtlConfig,
    index_ttl_secs: u64,
}

impl TaggedCache {
    pub fn new(store: StoreClient, categories: CategoryTtlConfig, index_ttl_secs: u64) -> Self {
        Self {
            store,
            categories,
            index_ttl_secs,
        }
    }

    pub fn from_settings(store: StoreClient, settings: &CacheSettings) -> Self {
        Self::new(store, settings.categories.clone(), settings.index_ttl_secs)
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    /// `<prefix>:<fixed-length hash of identifier>`.
    pub fn key(prefix: &str, identifier: impl fmt::Display) -> String {
        format!("{prefix}:{}", short_hash(identifier.to_string().as_bytes()))
    }

    /// TTL an entry in `prefix` gets when none (or zero) is supplied.
    pub fn default_ttl(&self, prefix: &str) -> u64 {
        self.categories.ttl_for(prefix)
    }

    /// Store a value and register its tags and dependencies.
    ///
    /// Registrations from an earlier `set` of the same key are replaced,
    /// not merged. Returns `false` if the value was not stored. An entry
    /// whose index registration fails is removed again, so it cannot outlive
    /// a tag or dependency invalidation.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        prefix: &str,
        identifier: impl fmt::Display,
        value: &T,
        options: &EntryOptions,
    ) -> bool {
        let key = Self::key(prefix, identifier);
        let ttl = match options.ttl {
            Some(secs) if secs > 0 => secs,
            _ => self.default_ttl(prefix),
        };
        self.clear_registrations(&key).await;
        if !self.store.set(&key, value, Some(ttl)).await {
            return false;
        }

        let index_ttl = self.index_ttl_secs.max(ttl);
        let member = [key.clone()];
        let mut registered = true;
        if !options.tags.is_empty() {
            registered &= self
                .store
                .add_to_set(&entry_tags_key(&key), &options.tags, index_ttl)
                .await;
            for tag in &options.tags {
                registered &= self.store.add_to_set(&tag_key(tag), &member, index_ttl).await;
            }
        }
        if !options.dependencies.is_empty() {
            registered &= self
                .store
                .add_to_set(&deps_key(&key), &options.dependencies, index_ttl)
                .await;
            for dependency in &options.dependencies {
                registered &= self
                    .store
                    .add_to_set(&rdeps_key(dependency), &member, index_ttl)
                    .await;
            }
        }

        if !registered {
            tracing::warn!(key = %key, "index registration failed, dropping entry");
            self.remove_entry(&key).await;
            return false;
        }
        true
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        prefix: &str,
        identifier: impl fmt::Display,
    ) -> Option<T> {
        self.store.get(&Self::key(prefix, identifier)).await
    }

    /// Withdraw `key` from every tag set and reverse dependency set it was
    /// registered in, then drop its forward records.
    async fn clear_registrations(&self, key: &str) {
        let deps_record = deps_key(key);
        let tags_record = entry_tags_key(key);
        let dependencies = self.store.set_members(&deps_record).await;
        let tags = self.store.set_members(&tags_record).await;
        if dependencies.is_empty() && tags.is_empty() {
            return;
        }

        let member = [key.to_string()];
        for dependency in &dependencies {
            self.store
                .remove_from_set(&rdeps_key(dependency), &member)
                .await;
        }
        for tag in &tags {
            self.store.remove_from_set(&tag_key(tag), &member).await;
        }
        self.store.delete_index(&[deps_record, tags_record]).await;
    }

    /// Delete an entry and drop its registrations.
    async fn remove_entry(&self, key: &str) -> u64 {
        let removed = self.store.delete(key).await;
        self.clear_registrations(key).await;
        removed
    }

    /// Delete one entry. Does not cascade to dependents. Returns whether
    /// the entry existed.
    pub async fn invalidate(&self, prefix: &str, identifier: impl fmt::Display) -> bool {
        self.remove_entry(&Self::key(prefix, identifier)).await > 0
    }

    /// Delete every entry registered under `tag`, then the tag set itself.
    ///
    /// Members are deleted one by one; a failing member is logged and
    /// skipped, and the tag set is cleared regardless. The count covers
    /// successful deletions only.
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        let set = tag_key(tag);
        let members = self.store.set_members(&set).await;
        let mut removed = 0;
        for key in &members {
            removed += self.remove_entry(key).await;
        }
        self.store.delete_index(&[set]).await;
        tracing::info!(tag = %tag, members = members.len(), removed, "tag invalidated");
        removed
    }

    pub async fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> u64 {
        let mut removed = 0;
        for tag in tags {
            removed += self.invalidate_by_tag(tag.as_ref()).await;
        }
        removed
    }

    /// Delete every entry that declared a dependency on this entry.
    pub async fn invalidate_dependent(&self, prefix: &str, identifier: impl fmt::Display) -> u64 {
        self.invalidate_dependents_of(&Self::key(prefix, identifier))
            .await
    }

    /// Delete every entry that declared a dependency on `key`.
    pub async fn invalidate_dependents_of(&self, key: &str) -> u64 {
        let set = rdeps_key(key);
        let dependents = self.store.set_members(&set).await;
        let mut removed = 0;
        for dependent in &dependents {
            removed += self.remove_entry(dependent).await;
        }
        self.store.delete_index(&[set]).await;
        if !dependents.is_empty() {
            tracing::info!(key = %key, dependents = dependents.len(), removed, "dependents invalidated");
        }
        removed
    }

    /// [`invalidate`](Self::invalidate) plus
    /// [`invalidate_dependent`](Self::invalidate_dependent).
    pub async fn invalidate_cascade(&self, prefix: &str, identifier: impl fmt::Display) -> u64 {
        let key = Self::key(prefix, identifier);
        self.remove_entry(&key).await + self.invalidate_dependents_of(&key).await
    }

    /// Keys currently registered under a tag.
    pub async fn tag_members(&self, tag: &str) -> Vec<String> {
        self.store.set_members(&tag_key(tag)).await
    }

    /// Keys that declared a dependency on `key`.
    pub async fn dependents_of(&self, key: &str) -> Vec<String> {
        self.store.set_members(&rdeps_key(key)).await
    }

    pub async fn get_stats(&self) -> CacheStats {
        CacheStats::collect(&self.store).await
    }

    /// [`get_stats`](Self::get_stats) plus the member count of each tag.
    pub async fn get_stats_with_tags<S: AsRef<str>>(&self, tags: &[S]) -> CacheStats {
        let mut stats = CacheStats::collect(&self.store).await;
        for tag in tags {
            let tag = tag.as_ref();
            let members = self.tag_members(tag).await.len();
            stats.tags.insert(tag.to_string(), members);
        }
        stats
    }

    /// Bulk-populate entries keyed by identifier, e.g. at startup.
    pub async fn warm_cache<I, V>(&self, data: I, options: &WarmOptions) -> WarmReport
    where
        I: IntoIterator<Item = (String, V)>,
        V: Serialize,
    {
        let entry = EntryOptions {
            ttl: options.ttl,
            tags: options.tags.clone(),
            dependencies: Vec::new(),
        };
        let entry = &entry;
        let results: Vec<bool> = stream::iter(data)
            .map(|(identifier, value)| async move {
                self.set(&options.prefix, &identifier, &value, entry).await
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;

        let report = WarmReport {
            attempted: results.len(),
            stored: results.iter().filter(|stored| **stored).count(),
        };
        tracing::info!(
            prefix = %options.prefix,
            attempted = report.attempted,
            stored = report.stored,
            "cache warmed"
        );
        report
    }

    pub async fn health_check(&self) -> HealthReport {
        HealthReport::check(&self.store).await
    }
}
