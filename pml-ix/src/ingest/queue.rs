//! Concurrency-safe priority work queue
//!
//! A Mutex-wrapped BinaryHeap with async blocking dequeue. Workers claim an
//! item at dequeue time while the queue lock is held, which is what enforces
//! at-most-one PROCESSING execution per item id: the claim callback performs
//! the QUEUED → PROCESSING transition before the entry leaves the queue.

use chrono::{DateTime, Datelike, Utc};
use pml_common::models::ProcessingState;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

/// Queue ordering mode for one ingestion batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Discovery order
    #[default]
    Fifo,
    /// Creation-year descending, then creation date descending, then id
    ByYear,
}

/// Heap key; ordering picks what a worker dequeues next
#[derive(Debug, Clone, PartialEq, Eq)]
enum OrderKey {
    Fifo {
        seq: u64,
    },
    ByYear {
        year: i32,
        created_ms: i64,
        id: Uuid,
    },
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use OrderKey::*;
        match (self, other) {
            // Earlier submissions pop first
            (Fifo { seq: a }, Fifo { seq: b }) => b.cmp(a),
            // Newer years pop first, then newer dates, then smaller id
            // for determinism
            (
                ByYear {
                    year: ya,
                    created_ms: ca,
                    id: ia,
                },
                ByYear {
                    year: yb,
                    created_ms: cb,
                    id: ib,
                },
            ) => ya
                .cmp(yb)
                .then_with(|| ca.cmp(cb))
                .then_with(|| ib.cmp(ia)),
            // A batch uses one mode; if modes ever mix, year-prioritized
            // work goes first
            (ByYear { .. }, Fifo { .. }) => std::cmp::Ordering::Greater,
            (Fifo { .. }, ByYear { .. }) => std::cmp::Ordering::Less,
        }
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One unit of pending analysis work
#[derive(Debug, Clone)]
pub struct WorkEntry {
    pub id: Uuid,
    /// State to restore if this entry is cancelled before completion
    pub revert: ProcessingState,
    key: OrderKey,
}

impl Ord for WorkEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for WorkEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WorkEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for WorkEntry {}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<WorkEntry>,
    queued: HashSet<Uuid>,
    paused: bool,
    closed: bool,
    fifo_seq: u64,
}

/// Priority work queue with blocking dequeue, pause/resume, and cancellation
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit an item. Returns false if the id is already queued (an item
    /// is never enqueued twice) or the queue is closed.
    pub fn push(
        &self,
        id: Uuid,
        created_at: DateTime<Utc>,
        priority: Priority,
        revert: ProcessingState,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed || !state.queued.insert(id) {
            return false;
        }
        let key = match priority {
            Priority::Fifo => {
                state.fifo_seq += 1;
                OrderKey::Fifo {
                    seq: state.fifo_seq,
                }
            }
            Priority::ByYear => OrderKey::ByYear {
                year: created_at.year(),
                created_ms: created_at.timestamp_millis(),
                id,
            },
        };
        state.heap.push(WorkEntry { id, revert, key });
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Remove not-yet-started entries. Returns the removed entries so the
    /// caller can restore their pre-enqueue states.
    pub fn cancel(&self, ids: &[Uuid]) -> Vec<WorkEntry> {
        let targets: HashSet<Uuid> = ids.iter().copied().collect();
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        state.heap.retain(|entry| {
            if targets.contains(&entry.id) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        for entry in &removed {
            state.queued.remove(&entry.id);
        }
        removed
    }

    /// Stop handing out work until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.paused = false;
        }
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    /// Close the queue; blocked dequeuers drain remaining work then get None
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.state.lock().unwrap().queued.contains(&id)
    }

    /// Blocking dequeue with claim-at-dequeue.
    ///
    /// `claim` runs under the queue lock and must atomically mark the item
    /// PROCESSING; entries whose claim fails (state moved underneath, e.g.
    /// cancellation) are discarded and the next entry is tried. Returns
    /// None only after [`close`](Self::close) once the queue is drained.
    pub async fn pop_claim(&self, mut claim: impl FnMut(Uuid) -> bool) -> Option<WorkEntry> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if !state.paused {
                    while let Some(entry) = state.heap.pop() {
                        state.queued.remove(&entry.id);
                        if claim(entry.id) {
                            if !state.heap.is_empty() {
                                // Keep sibling workers awake
                                self.notify.notify_one();
                            }
                            return Some(entry);
                        }
                        tracing::debug!(item_id = %entry.id, "Dequeued entry no longer claimable, skipping");
                    }
                }
                if state.closed && state.heap.is_empty() {
                    return None;
                }
            }
            notified.await;
        }
    }
}
