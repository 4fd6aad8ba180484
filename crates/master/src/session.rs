//! Per-worker session state.
//!
//! A `Session` is only ever reached through its `SessionRef` handle fetched
//! from the `SessionTable`; every read or write happens under that session's
//! own mutex.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use vecfarm_wire::{ClientId, InstanceId, Nonce, WorkerCommand};

use crate::router::Command;

/// `environment_id` reported for sessions not bound to a slot.
pub const UNBOUND_ENVIRONMENT: i32 = -1;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Registered, INITIALIZE not yet answered.
    Uninitialized,
    /// Name handed out, waiting for CONNECT.
    Connected,
    /// Spaces registered, frames flowing.
    Streaming,
    /// RESET_CLIENT delivered; the worker must re-run INITIALIZE.
    Resetting,
    /// Terminal. The session is no longer in the table.
    Closed,
}

/// Master-side state for one worker environment instance.
#[derive(Debug)]
pub struct Session {
    pub client_id: ClientId,
    pub instance_id: InstanceId,
    pub state: SessionState,
    /// Last accepted frame nonce; 0 until the first frame.
    pub last_nonce: Nonce,
    /// Next command to hand to the worker. Last writer wins.
    pub pending_command: Option<Command>,
    /// Set once at CONNECT.
    pub spaces: Option<Vec<u8>>,
    pub environment_id: Option<i32>,
    pub last_contact: Instant,
    /// Marked by the heartbeat sweep; the next request is answered RESET.
    pub evict_pending: bool,
}

/// Shared handle to a session.
pub type SessionRef = Arc<Mutex<Session>>;

impl Session {
    /// Create a new session.
    pub fn new(client_id: ClientId, instance_id: InstanceId, now: Instant) -> Self {
        Self {
            client_id,
            instance_id,
            state: SessionState::Uninitialized,
            last_nonce: 0,
            pending_command: None,
            spaces: None,
            environment_id: None,
            last_contact: now,
            evict_pending: false,
        }
    }

    /// Record contact from the worker.
    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_contact)
    }

    /// True once the sweep marked the session or it has been silent past `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.evict_pending || self.silent_for(now) > timeout
    }

    /// Nonce the worker must put on its next frame.
    pub fn expected_nonce(&self) -> Nonce {
        self.last_nonce + 1
    }

    /// Drain the pending command, stamped for this session's generation.
    ///
    /// Returns NO_COMMAND when nothing is pending.
    pub fn take_command(&mut self) -> WorkerCommand {
        let nonce = self.expected_nonce();
        match self.pending_command.take() {
            Some(command) => command.into_wire(nonce, self.instance_id),
            None => Command::no_command(nonce, self.instance_id),
        }
    }

    pub fn environment_id_or_unbound(&self) -> i32 {
        self.environment_id.unwrap_or(UNBOUND_ENVIRONMENT)
    }
}
