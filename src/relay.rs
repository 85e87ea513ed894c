//! Write path and fan-out over the shared relay state.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::blossom::{fetch_event_blob, BlobStore};
use crate::error::RelayError;
use crate::event::{replace_class, Event, ReplaceClass, KIND_FILE_METADATA};
use crate::filter::{compile, Filter, Plan};
use crate::policy::Policy;
use crate::storage::Store;
use crate::subs::Registry;

const BUSY_RETRIES: u32 = 3;
/// Pause between fan-out deliveries so a burst of subscriptions does not
/// monopolise the write path.
const FANOUT_PACE: Duration = Duration::from_millis(3);

/// Shared state tying storage, policy, and subscriptions together.
pub struct Relay {
    pub store: Store,
    pub policy: Policy,
    pub registry: Registry,
    pub allowed_kinds: Vec<u16>,
    /// Blob store for the post-write downloader, when enabled.
    pub blobs: Option<BlobStore>,
}

impl Relay {
    pub fn new(store: Store, policy: Policy, allowed_kinds: Vec<u16>) -> Self {
        Self {
            store,
            policy,
            registry: Registry::new(),
            allowed_kinds,
            blobs: None,
        }
    }

    /// Enable background fetching of blob artifacts referenced by accepted
    /// file-metadata events.
    pub fn with_blob_fetch(mut self, blobs: BlobStore) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Compile a filter set against this relay's admission gate.
    pub fn compile(&self, filters: &[Filter]) -> Plan {
        compile(filters, &self.allowed_kinds)
    }

    /// Validate and persist a submitted event.
    ///
    /// `StorageBusy` is retried a bounded number of times; every other error
    /// is reported to the caller unchanged.
    pub async fn publish(&self, ev: &Event) -> Result<(), RelayError> {
        self.policy.validate(ev)?;
        let mut attempt = 0;
        loop {
            match self.write(ev) {
                Err(e) if e.is_retryable() && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(u64::from(10 * attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// One write attempt: dedup, replacement lookup, transactional commit.
    fn write(&self, ev: &Event) -> Result<(), RelayError> {
        if self.store.exists(&ev.id)? {
            return Err(RelayError::Duplicate);
        }
        // Replacement is newest-submission-wins: whatever currently holds the
        // key is removed in the same transaction that inserts the new event.
        let id_to_remove = match replace_class(ev.kind) {
            ReplaceClass::Replaceable => self.store.current_holder(&ev.pubkey, ev.kind, None)?,
            ReplaceClass::Parameterized => {
                self.store
                    .current_holder(&ev.pubkey, ev.kind, Some(ev.d_tag()))?
            }
            _ => None,
        };
        self.store.replace(ev, id_to_remove.as_deref())
    }

    /// Historical query for a client-facing request. Ephemeral events are
    /// deleted once returned, so a second identical query yields nothing.
    pub fn run_historical(&self, plan: &Plan) -> Result<Vec<Event>, RelayError> {
        let events = self.store.query(plan)?;
        for ev in &events {
            if replace_class(ev.kind) == ReplaceClass::Ephemeral {
                self.store.delete_by_id(&ev.id)?;
            }
        }
        Ok(events)
    }

    /// Post-write hook for an accepted event: kick off the blob downloader
    /// when applicable, then fan the event out to live subscriptions.
    ///
    /// Callers must enqueue the OK frame before invoking this, so the ack
    /// always precedes the notifications it triggers on the same connection.
    pub fn after_write(self: &Arc<Self>, ev: &Event) {
        if ev.kind == KIND_FILE_METADATA {
            if let Some(blobs) = self.blobs.clone() {
                tokio::spawn(fetch_event_blob(blobs, ev.clone()));
            }
        }
        let relay = self.clone();
        let ev = ev.clone();
        tokio::spawn(async move { relay.fan_out(ev).await });
    }

    /// Re-match a written event against every live subscription and deliver
    /// an EVENT frame to each one whose filters still select it.
    pub async fn fan_out(&self, ev: Event) {
        for sub in self.registry.snapshot() {
            if sub.is_closed() {
                continue;
            }
            if self.matches(&sub.filters, &ev) {
                let frame = serde_json::json!(["EVENT", sub.key.req, ev]).to_string();
                sub.deliver(frame);
                tokio::time::sleep(FANOUT_PACE).await;
            }
        }
    }

    /// Single source of truth for "event matches filter set": compile the
    /// set constrained to this id and run it through the same SQL the
    /// historical path uses.
    fn matches(&self, filters: &[Filter], ev: &Event) -> bool {
        let constrained: Vec<Filter> =
            filters.iter().map(|f| f.constrained_to(&ev.id)).collect();
        let plan = self.compile(&constrained);
        match self.store.query(&plan) {
            Ok(events) => events.iter().any(|e| e.id == ev.id),
            Err(e) => {
                warn!(error = %e, "fan-out match query failed");
                false
            }
        }
    }
}
