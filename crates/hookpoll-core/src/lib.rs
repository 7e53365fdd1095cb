//! Core domain model and per-target delivery bookkeeping for hookpoll.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "hookpoll-core";

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_LOOKBACK_MINUTES: u32 = 60;

/// Identifies one externally polled resource (a repository + webhook configuration).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollingTargetId(String);

impl PollingTargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollingTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PollingTargetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PollingTargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Github,
    Gitlab,
    Bitbucket,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::Github,
        SourceType::Gitlab,
        SourceType::Bitbucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Github => "github",
            SourceType::Gitlab => "gitlab",
            SourceType::Bitbucket => "bitbucket",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One webhook delivery record as fetched from the provider.
///
/// Everything besides `delivery_id` is carried through to the manager untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub delivery_id: String,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    pub delivered_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl DeliveryEvent {
    /// Bare event carrying only an id; handy for sources without payload detail.
    pub fn with_id(delivery_id: impl Into<String>, delivered_at: DateTime<Utc>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            guid: None,
            event: None,
            action: None,
            delivered_at,
            headers: BTreeMap::new(),
            payload: JsonValue::Null,
        }
    }
}

/// Provider-specific attributes describing where to poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAttributes {
    /// `owner/name`.
    pub repository: String,
    pub webhook_id: String,
    #[serde(default)]
    pub api_url: Option<String>,
    /// Name of the environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: u32,
}

fn default_lookback_minutes() -> u32 {
    DEFAULT_LOOKBACK_MINUTES
}

impl SourceAttributes {
    pub fn api_url(&self) -> &str {
        self.api_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or(DEFAULT_GITHUB_API_URL)
    }
}

/// Immutable request handed to the executor by whatever schedules ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    pub target_id: PollingTargetId,
    pub account_id: String,
    pub polling_doc_id: String,
    pub source_type: SourceType,
    pub attributes: SourceAttributes,
}

/// Delta forwarded to the manager on publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishBatch {
    pub new_events: Vec<DeliveryEvent>,
    pub delete_ids: BTreeSet<String>,
    pub is_first_poll: bool,
}

impl PublishBatch {
    pub fn is_empty(&self) -> bool {
        self.new_events.is_empty() && self.delete_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Failure,
}

/// What a publish sink transmits: either a batch or notice of a failed collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingReport {
    pub target_id: PollingTargetId,
    pub account_id: String,
    pub polling_doc_id: String,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<PublishBatch>,
}

impl PollingReport {
    pub fn batch(request: &PollRequest, batch: PublishBatch) -> Self {
        Self {
            target_id: request.target_id.clone(),
            account_id: request.account_id.clone(),
            polling_doc_id: request.polling_doc_id.clone(),
            status: ReportStatus::Success,
            error_message: None,
            batch: Some(batch),
        }
    }

    pub fn failure(request: &PollRequest, message: impl Into<String>) -> Self {
        Self {
            target_id: request.target_id.clone(),
            account_id: request.account_id.clone(),
            polling_doc_id: request.polling_doc_id.clone(),
            status: ReportStatus::Failure,
            error_message: Some(message.into()),
            batch: None,
        }
    }
}

/// Status handed back to the scheduler after each tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickResult {
    pub status_code: u16,
    pub message: String,
}

impl TickResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Per-target bookkeeping of which deliveries the manager has already seen.
///
/// An id is either confirmed (`published`) or awaiting confirmation
/// (`pending_publish`), never both. `pending_events` holds the payloads for
/// exactly the ids in `pending_publish`, in fetch order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryCache {
    published: BTreeSet<String>,
    pending_publish: BTreeSet<String>,
    pending_events: Vec<DeliveryEvent>,
    pending_delete: BTreeSet<String>,
    first_poll: bool,
}

impl Default for DeliveryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryCache {
    pub fn new() -> Self {
        Self {
            published: BTreeSet::new(),
            pending_publish: BTreeSet::new(),
            pending_events: Vec::new(),
            pending_delete: BTreeSet::new(),
            first_poll: true,
        }
    }

    pub fn needs_to_publish(&self) -> bool {
        !self.pending_events.is_empty() || !self.pending_delete.is_empty()
    }

    /// Diff a fresh fetch against what has been published.
    ///
    /// An empty fetch is ignored so a provider glitch cannot mark every
    /// published id for deletion.
    pub fn populate(&mut self, fresh: Vec<DeliveryEvent>) {
        if fresh.is_empty() {
            return;
        }

        let fresh_ids: BTreeSet<String> = fresh.iter().map(|e| e.delivery_id.clone()).collect();

        for event in fresh {
            if self.published.contains(&event.delivery_id) {
                continue;
            }
            if self.pending_publish.insert(event.delivery_id.clone()) {
                self.pending_events.push(event);
            }
        }

        for id in self.published.difference(&fresh_ids) {
            self.pending_delete.insert(id.clone());
        }
    }

    /// Move confirmed events from pending into `published`.
    pub fn clear_published(&mut self, confirmed: &[DeliveryEvent]) {
        if confirmed.is_empty() {
            return;
        }
        let confirmed_ids: BTreeSet<&str> =
            confirmed.iter().map(|e| e.delivery_id.as_str()).collect();
        for id in &confirmed_ids {
            self.pending_publish.remove(*id);
            self.published.insert((*id).to_string());
        }
        self.pending_events
            .retain(|e| !confirmed_ids.contains(e.delivery_id.as_str()));
    }

    pub fn remove_deleted_ids<'a, I>(&mut self, confirmed_deleted: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for id in confirmed_deleted {
            self.published.remove(id);
            self.pending_delete.remove(id);
        }
    }

    /// One-way: only `false` has an effect.
    pub fn set_first_collection_on_delegate(&mut self, first: bool) {
        if !first {
            self.first_poll = false;
        }
    }

    pub fn is_first_poll(&self) -> bool {
        self.first_poll
    }

    pub fn pending_batch(&self) -> PublishBatch {
        PublishBatch {
            new_events: self.pending_events.clone(),
            delete_ids: self.pending_delete.clone(),
            is_first_poll: self.first_poll,
        }
    }

    pub fn published(&self) -> &BTreeSet<String> {
        &self.published
    }

    pub fn pending_publish(&self) -> &BTreeSet<String> {
        &self.pending_publish
    }

    pub fn pending_events(&self) -> &[DeliveryEvent] {
        &self.pending_events
    }

    pub fn pending_delete(&self) -> &BTreeSet<String> {
        &self.pending_delete
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            published: self.published.len(),
            pending_publish: self.pending_publish.len(),
            pending_delete: self.pending_delete.len(),
            is_first_poll: self.first_poll,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub published: usize,
    pub pending_publish: usize,
    pub pending_delete: usize,
    pub is_first_poll: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn events(ids: &[&str]) -> Vec<DeliveryEvent> {
        ids.iter().map(|id| DeliveryEvent::with_id(*id, ts())).collect()
    }

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn published_cache(items: &[&str]) -> DeliveryCache {
        let mut cache = DeliveryCache::new();
        cache.populate(events(items));
        let batch = cache.pending_batch();
        cache.clear_published(&batch.new_events);
        cache
    }

    #[test]
    fn fresh_cache_is_idle_and_first_poll() {
        let cache = DeliveryCache::new();
        assert!(!cache.needs_to_publish());
        assert!(cache.is_first_poll());
        assert!(cache.pending_batch().is_empty());
    }

    #[test]
    fn populate_queues_unseen_events_in_fetch_order() {
        let mut cache = DeliveryCache::new();
        cache.populate(events(&["d2", "d1", "d3"]));

        assert!(cache.needs_to_publish());
        assert_eq!(cache.pending_publish(), &ids(&["d1", "d2", "d3"]));
        let order: Vec<_> = cache.pending_events().iter().map(|e| e.delivery_id.as_str()).collect();
        assert_eq!(order, vec!["d2", "d1", "d3"]);
        assert!(cache.pending_delete().is_empty());
    }

    #[test]
    fn populate_twice_is_idempotent() {
        let mut once = DeliveryCache::new();
        once.populate(events(&["d1", "d2"]));

        let mut twice = DeliveryCache::new();
        twice.populate(events(&["d1", "d2"]));
        twice.populate(events(&["d1", "d2"]));

        assert_eq!(once, twice);
    }

    #[test]
    fn populate_with_duplicate_ids_in_one_fetch_keeps_one_event() {
        let mut cache = DeliveryCache::new();
        cache.populate(events(&["d1", "d1"]));
        assert_eq!(cache.pending_events().len(), 1);
    }

    #[test]
    fn empty_fetch_leaves_cache_unchanged() {
        let mut cache = published_cache(&["a", "b"]);
        let before = cache.clone();
        cache.populate(Vec::new());
        assert_eq!(cache, before);
    }

    #[test]
    fn vanished_published_ids_are_marked_for_deletion() {
        let mut cache = published_cache(&["A", "B", "C"]);
        cache.populate(events(&["A", "C"]));

        assert_eq!(cache.pending_delete(), &ids(&["B"]));
        assert!(cache.pending_publish().is_empty());
        assert!(cache.needs_to_publish());
    }

    #[test]
    fn already_published_ids_are_not_requeued() {
        let mut cache = published_cache(&["A"]);
        cache.populate(events(&["A", "B"]));
        assert_eq!(cache.pending_publish(), &ids(&["B"]));
    }

    #[test]
    fn clear_published_moves_only_confirmed_events() {
        let mut cache = DeliveryCache::new();
        cache.populate(events(&["d1", "d2"]));
        cache.clear_published(&events(&["d1"]));

        assert_eq!(cache.published(), &ids(&["d1"]));
        assert_eq!(cache.pending_publish(), &ids(&["d2"]));
        assert_eq!(cache.pending_events().len(), 1);
        assert_eq!(cache.pending_events()[0].delivery_id, "d2");
    }

    #[test]
    fn remove_deleted_ids_finalizes_deletion() {
        let mut cache = published_cache(&["A", "B"]);
        cache.populate(events(&["A"]));
        let batch = cache.pending_batch();
        cache.remove_deleted_ids(&batch.delete_ids);

        assert_eq!(cache.published(), &ids(&["A"]));
        assert!(cache.pending_delete().is_empty());
        assert!(!cache.needs_to_publish());
    }

    #[test]
    fn first_collection_flag_only_turns_off() {
        let mut cache = DeliveryCache::new();
        cache.set_first_collection_on_delegate(true);
        assert!(cache.is_first_poll());
        cache.set_first_collection_on_delegate(false);
        assert!(!cache.is_first_poll());
        cache.set_first_collection_on_delegate(true);
        assert!(!cache.is_first_poll());
        assert!(!cache.pending_batch().is_first_poll);
    }

    #[test]
    fn snapshot_reports_set_sizes() {
        let mut cache = published_cache(&["A", "B"]);
        cache.populate(events(&["A", "C"]));
        let snap = cache.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.pending_publish, 1);
        assert_eq!(snap.pending_delete, 1);
    }

    #[test]
    fn poll_request_parses_from_yaml_shaped_json() {
        let request: PollRequest = serde_json::from_value(serde_json::json!({
            "target_id": "pt-1",
            "account_id": "acc",
            "polling_doc_id": "doc",
            "source_type": "github",
            "attributes": { "repository": "octo/hello", "webhook_id": "42" }
        }))
        .expect("parse");
        assert_eq!(request.target_id.as_str(), "pt-1");
        assert_eq!(request.source_type, SourceType::Github);
        assert_eq!(request.attributes.lookback_minutes, DEFAULT_LOOKBACK_MINUTES);
        assert_eq!(request.attributes.api_url(), DEFAULT_GITHUB_API_URL);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Populate(Vec<u8>),
        ConfirmPending,
        ConfirmHalf,
        ConfirmDeletes,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec(0u8..12, 0..8).prop_map(Op::Populate),
            Just(Op::ConfirmPending),
            Just(Op::ConfirmHalf),
            Just(Op::ConfirmDeletes),
        ]
    }

    proptest! {
        #[test]
        fn published_and_pending_stay_disjoint(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let mut cache = DeliveryCache::new();
            for op in ops {
                match op {
                    Op::Populate(raw) => {
                        let fresh = raw
                            .iter()
                            .map(|n| DeliveryEvent::with_id(format!("d{n}"), ts()))
                            .collect();
                        cache.populate(fresh);
                    }
                    Op::ConfirmPending => {
                        let batch = cache.pending_batch();
                        cache.clear_published(&batch.new_events);
                    }
                    Op::ConfirmHalf => {
                        let batch = cache.pending_batch();
                        let half = batch.new_events.len() / 2;
                        cache.clear_published(&batch.new_events[..half]);
                    }
                    Op::ConfirmDeletes => {
                        let batch = cache.pending_batch();
                        cache.remove_deleted_ids(&batch.delete_ids);
                    }
                }

                prop_assert!(cache.published().is_disjoint(cache.pending_publish()));
                let event_ids: BTreeSet<String> =
                    cache.pending_events().iter().map(|e| e.delivery_id.clone()).collect();
                prop_assert_eq!(&event_ids, cache.pending_publish());
                prop_assert_eq!(event_ids.len(), cache.pending_events().len());
            }
        }
    }
}
