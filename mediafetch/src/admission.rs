//! Admission control for download requests.
//!
//! Two limits are enforced together before a request may touch the network:
//!
//! 1. A global counting semaphore bounding concurrent fetches (default 3).
//! 2. A per-requester single-flight guard: a requester with a live ticket is
//!    rejected until that ticket is released or its TTL (default 300s) lapses.
//!
//! Both checks fail fast; nothing is queued.
//!
//! The global permit travels inside the [`AdmissionTicket`], so capacity is
//! returned as soon as the ticket is released or dropped. The requester slot
//! only expires by TTL if the ticket was lost without a release, which
//! guards against callers that never clean up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Default global concurrency limit.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default single-flight TTL per requester (5 minutes).
pub const DEFAULT_REQUESTER_TTL_SECS: u64 = 300;

/// Configuration for the admission controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum concurrent fetches across all requesters (default: 3).
    pub max_concurrent: usize,
    /// Lifetime of an unreleased requester slot (default: 300s).
    pub requester_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            requester_ttl: Duration::from_secs(DEFAULT_REQUESTER_TTL_SECS),
        }
    }
}

/// Why a ticket was not issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The requester already has a live ticket.
    #[error("requester {requester_id} already has a download in progress (retry in {retry_after:?})")]
    RequesterBusy {
        requester_id: String,
        retry_after: Duration,
    },

    /// Every global slot is taken.
    #[error("all {limit} download slots are in use")]
    AtCapacity { limit: usize },
}

/// Proof of admission. Holds one global slot until released or dropped.
#[derive(Debug)]
pub struct AdmissionTicket {
    id: u64,
    requester_id: String,
    acquired_at: Instant,
    expires_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionTicket {
    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the ticket still holds its global slot.
    pub fn is_live(&self) -> bool {
        self.permit.is_some()
    }
}

#[derive(Debug)]
struct RequesterSlot {
    ticket_id: u64,
    expires_at: Instant,
}

/// Global concurrency bound plus per-requester single-flight.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    semaphore: Arc<Semaphore>,
    next_ticket: AtomicU64,
    slots: Mutex<HashMap<String, RequesterSlot>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let max = config.max_concurrent.max(1);
        tracing::info!(
            max_concurrent = max,
            requester_ttl_secs = config.requester_ttl.as_secs(),
            "Admission controller created"
        );
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            config: AdmissionConfig {
                max_concurrent: max,
                ..config
            },
            next_ticket: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Admits a requester or rejects immediately.
    pub fn try_acquire(&self, requester_id: &str) -> Result<AdmissionTicket, Rejection> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get(requester_id) {
            if slot.expires_at > now {
                return Err(Rejection::RequesterBusy {
                    requester_id: requester_id.to_string(),
                    retry_after: slot.expires_at - now,
                });
            }
            tracing::debug!(requester = requester_id, "Reclaiming expired requester slot");
            slots.remove(requester_id);
        }

        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| Rejection::AtCapacity {
                limit: self.config.max_concurrent,
            })?;

        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let expires_at = now + self.config.requester_ttl;
        slots.insert(
            requester_id.to_string(),
            RequesterSlot {
                ticket_id: id,
                expires_at,
            },
        );

        Ok(AdmissionTicket {
            id,
            requester_id: requester_id.to_string(),
            acquired_at: now,
            expires_at,
            permit: Some(permit),
        })
    }

    /// Returns the ticket's global slot and clears its requester slot.
    ///
    /// Idempotent: releasing an already released ticket, or one whose
    /// requester slot expired and was reissued, only frees what the ticket
    /// itself still holds. Returns whether the requester slot was cleared.
    pub fn release(&self, ticket: &mut AdmissionTicket) -> bool {
        ticket.permit.take();

        let mut slots = self.slots.lock();
        let owns_slot = slots
            .get(&ticket.requester_id)
            .is_some_and(|slot| slot.ticket_id == ticket.id);
        if owns_slot {
            slots.remove(&ticket.requester_id);
        }
        owns_slot
    }

    /// Drops requester slots whose TTL has lapsed. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.expires_at > now);
        let purged = before - slots.len();
        if purged > 0 {
            tracing::info!(purged, "Purged stale requester slots");
        }
        purged
    }

    /// Whether `requester_id` currently holds a live slot.
    pub fn is_busy(&self, requester_id: &str) -> bool {
        let now = Instant::now();
        self.slots
            .lock()
            .get(requester_id)
            .is_some_and(|slot| slot.expires_at > now)
    }

    /// Fetches currently admitted.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent - self.semaphore.available_permits()
    }

    /// Global slots still free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
