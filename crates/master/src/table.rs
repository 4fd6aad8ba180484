//! Concurrency-safe registry of live sessions.
//!
//! The table is the sole owner of session lifetime. Other components keep only
//! a client id and re-fetch the `SessionRef` when they need it.
//!
//! Lock order: a session mutex may be held while touching the table or the
//! slot list, never the reverse. Table guards are always dropped before a
//! session mutex is taken, and no two session mutexes are ever held at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};
use vecfarm_wire::{ClientId, InstanceId, Nonce};

use crate::session::{Session, SessionRef, SessionState};

/// Registry mapping client id → session, plus environment slot bookkeeping.
pub struct SessionTable {
    sessions: DashMap<ClientId, SessionRef>,
    /// Slot index → owning client.
    slots: Mutex<Vec<Option<ClientId>>>,
    /// Last accepted nonce of every streaming session.
    progress: DashMap<ClientId, Nonce>,
    next_client_id: AtomicI32,
    next_instance_id: AtomicI64,
}

impl SessionTable {
    /// Create a table serving `number_of_environments` slots.
    pub fn new(number_of_environments: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            slots: Mutex::new(vec![None; number_of_environments]),
            progress: DashMap::new(),
            next_client_id: AtomicI32::new(1),
            next_instance_id: AtomicI64::new(1),
        }
    }

    /// Hand out a fresh, never-before-seen client id.
    pub fn issue_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// True if `client_id` was handed out by `issue_client_id`.
    pub fn was_issued(&self, client_id: ClientId) -> bool {
        client_id > 0 && client_id < self.next_client_id.load(Ordering::Relaxed)
    }

    fn next_instance_id(&self) -> InstanceId {
        self.next_instance_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a fresh session under `client_id`, replacing any existing one.
    ///
    /// The replaced session is retired: marked closed, its pending command
    /// discarded and its slot released.
    pub fn register(&self, client_id: ClientId, now: Instant) -> SessionRef {
        let instance_id = self.next_instance_id();
        let handle: SessionRef = Arc::new(Mutex::new(Session::new(client_id, instance_id, now)));

        if let Some(previous) = self.sessions.insert(client_id, Arc::clone(&handle)) {
            let mut old = previous.lock();
            debug!(
                client_id,
                old_instance = old.instance_id,
                "replacing live session"
            );
            self.release(&mut old);
        }

        info!(client_id, instance_id, "session registered");
        handle
    }

    /// Fetch the live session for `client_id`.
    pub fn lookup(&self, client_id: ClientId) -> Option<SessionRef> {
        self.sessions.get(&client_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove whatever session is registered under `client_id`.
    ///
    /// Returns false if there was none.
    pub fn remove(&self, client_id: ClientId) -> bool {
        match self.sessions.remove(&client_id) {
            Some((_, handle)) => {
                let mut session = handle.lock();
                self.release(&mut session);
                info!(client_id, "session removed");
                true
            }
            None => false,
        }
    }

    /// Remove `handle` from the table while its lock is held.
    ///
    /// Only removes the entry if it still points at this exact session, so a
    /// concurrent replacement is left alone.
    pub fn retire(&self, handle: &SessionRef, session: &mut Session) {
        let client_id = session.client_id;
        self.sessions
            .remove_if(&client_id, |_, current| Arc::ptr_eq(current, handle));
        self.release(session);
    }

    fn release(&self, session: &mut Session) {
        if session.state == SessionState::Closed {
            return;
        }
        session.state = SessionState::Closed;
        session.pending_command = None;
        self.progress.remove(&session.client_id);
        if let Some(environment_id) = session.environment_id.take() {
            self.release_slot(environment_id, session.client_id);
        }
    }

    /// Record `nonce` as the last accepted frame of a streaming session.
    pub fn record_progress(&self, client_id: ClientId, nonce: Nonce) {
        self.progress.insert(client_id, nonce);
    }

    /// Stop counting `client_id` towards the leading nonce.
    pub fn clear_progress(&self, client_id: ClientId) {
        self.progress.remove(&client_id);
    }

    /// Highest last-accepted nonce over streaming sessions; 0 when none.
    pub fn leading_nonce(&self) -> Nonce {
        self.progress
            .iter()
            .map(|entry| *entry.value())
            .max()
            .unwrap_or(0)
    }

    /// Bind the lowest free environment slot to `client_id`.
    pub fn bind_slot(&self, client_id: ClientId) -> Option<i32> {
        let mut slots = self.slots.lock();
        let index = slots.iter().position(Option::is_none)?;
        let environment_id = i32::try_from(index).ok()?;
        slots[index] = Some(client_id);
        Some(environment_id)
    }

    fn release_slot(&self, environment_id: i32, client_id: ClientId) {
        let Ok(index) = usize::try_from(environment_id) else {
            return;
        };
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index) {
            if *slot == Some(client_id) {
                *slot = None;
            }
        }
    }

    /// Clone out every (client id, handle) pair.
    ///
    /// Table guards are released before returning, so callers may lock the
    /// handles freely.
    pub fn snapshot(&self) -> Vec<(ClientId, SessionRef)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of bound environment slots.
    pub fn bound_slots(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}
