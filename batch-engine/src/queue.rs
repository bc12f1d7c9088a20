//! In-memory priority queue of transactions waiting for a batch
//!
//! Ordering is priority descending, then enqueue sequence ascending. The
//! batch former never reorders within a tier: it consumes the queue in this
//! order and claims members under the same lock that selected them, so a
//! transaction can never be handed to two batches.

use crate::{
    config::BatchConfig,
    types::{BatchKey, Priority, Transaction},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Position in the queue
type OrderKey = (Reverse<Priority>, u64, Uuid);

#[derive(Debug)]
struct QueueEntry {
    seq: u64,
    tx: Transaction,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<Uuid, QueueEntry>,
    order: BTreeSet<OrderKey>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, seq: u64, tx: Transaction) {
        self.order.insert((Reverse(tx.priority), seq, tx.id));
        self.entries.insert(tx.id, QueueEntry { seq, tx });
    }

    fn remove(&mut self, id: &Uuid) -> Option<QueueEntry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&(Reverse(entry.tx.priority), entry.seq, *id));
        Some(entry)
    }

    /// Eligible entries in queue order
    fn eligible(&self, now: DateTime<Utc>) -> impl Iterator<Item = &QueueEntry> + '_ {
        self.order
            .iter()
            .filter_map(move |(_, _, id)| self.entries.get(id))
            .filter(move |entry| entry.tx.is_due(now) && !entry.tx.is_expired(now))
    }
}

/// Members claimed for one batch, in submission order
#[derive(Debug)]
pub struct ReadyGroup {
    /// Compatibility key shared by the members
    pub key: BatchKey,
    /// Claimed members
    pub members: Vec<Transaction>,
    /// Undersized group formed because its oldest member timed out
    pub undersized: bool,
    seqs: Vec<u64>,
}

/// Thread-safe priority queue
#[derive(Debug, Default)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
}

impl PriorityQueue {
    /// Create empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a transaction visible to the batch former. Returns false if already queued.
    pub fn push(&self, tx: Transaction) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains_key(&tx.id) {
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.insert(seq, tx);
        true
    }

    /// Remove a transaction (cancellation)
    pub fn remove(&self, id: &Uuid) -> Option<Transaction> {
        self.state.lock().remove(id).map(|entry| entry.tx)
    }

    /// Whether a transaction is currently queued
    pub fn contains(&self, id: &Uuid) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    /// Queue depth (including entries waiting on backoff)
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eligible transactions in batching order
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<Transaction> {
        let state = self.state.lock();
        state.eligible(now).map(|entry| entry.tx.clone()).collect()
    }

    /// Remove and return every entry whose expiry has passed
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Vec<Transaction> {
        let mut state = self.state.lock();
        let expired: Vec<Uuid> = state
            .order
            .iter()
            .map(|(_, _, id)| *id)
            .filter(|id| {
                state
                    .entries
                    .get(id)
                    .map_or(false, |entry| entry.tx.is_expired(now))
            })
            .collect();

        expired
            .iter()
            .filter_map(|id| state.remove(id))
            .map(|entry| entry.tx)
            .collect()
    }

    /// Claim every group that satisfies the formation policy
    ///
    /// A group (same [`BatchKey`]) is formed when it holds `max_batch_size`
    /// eligible members, or when its oldest member has waited at least
    /// `max_wait_time`. Groups below `min_batch_size` are still formed once
    /// timed out so that nothing waits indefinitely.
    pub fn take_ready_groups(&self, now: DateTime<Utc>, config: &BatchConfig) -> Vec<ReadyGroup> {
        let mut state = self.state.lock();

        let mut groups: BTreeMap<BatchKey, Vec<(u64, Uuid, DateTime<Utc>)>> = BTreeMap::new();
        for entry in state.eligible(now) {
            let queued_at = entry.tx.queued_at.unwrap_or(entry.tx.created_at);
            groups
                .entry(entry.tx.batch_key())
                .or_default()
                .push((entry.seq, entry.tx.id, queued_at));
        }

        let max_wait = config.max_wait_time();
        let mut ready = Vec::new();

        for (key, members) in groups {
            for chunk in members.chunks(config.max_batch_size.max(1)) {
                let full = chunk.len() >= config.max_batch_size;
                let timed_out = chunk
                    .iter()
                    .map(|(_, _, queued_at)| *queued_at)
                    .min()
                    .map_or(false, |oldest| now - oldest >= max_wait);

                if !full && !timed_out {
                    continue;
                }

                let mut claimed = Vec::with_capacity(chunk.len());
                let mut seqs = Vec::with_capacity(chunk.len());
                for (_, id, _) in chunk {
                    if let Some(entry) = state.remove(id) {
                        seqs.push(entry.seq);
                        claimed.push(entry.tx);
                    }
                }

                ready.push(ReadyGroup {
                    key: key.clone(),
                    undersized: claimed.len() < config.min_batch_size,
                    members: claimed,
                    seqs,
                });
            }
        }

        ready
    }

    /// Return a claimed group to its original queue positions
    pub fn restore(&self, group: ReadyGroup) {
        let mut state = self.state.lock();
        for (seq, tx) in group.seqs.into_iter().zip(group.members) {
            if !state.entries.contains_key(&tx.id) {
                state.insert(seq, tx);
            }
        }
    }
}
