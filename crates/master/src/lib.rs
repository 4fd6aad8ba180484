//! vecfarm Master Engine
//!
//! The master mediates between environment workers and the training loop.
//! It owns:
//! - Session management (one `Session` per connected worker)
//! - The protocol state machine answering every worker request
//! - Frame dispatch into a bounded ingestion queue, with WAIT backpressure
//! - Command routing from the training loop back to workers
//! - Heartbeat-based eviction of silent workers
//!
//! # Architecture
//!
//! The engine performs no I/O. A transport calls [`Master::handle`] (or
//! [`Master::handle_bytes`]) once per request from any number of connection
//! handlers concurrently, and writes the returned response back. The
//! training loop drains frames through [`IngestionQueue`] and submits
//! commands through [`Master::submit`].
//!
//! Requests for different sessions never contend on a shared lock: each
//! session is mutated under its own mutex, and the ingestion queue never
//! blocks a producer past a short bounded wait.

#![deny(unsafe_code)]

pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod router;
pub mod session;
pub mod table;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;
use vecfarm_wire::{ClientId, MasterRequest, MasterResponse, Nonce, RequestCommand, ResponseCode};

pub use dispatcher::{Frame, IngestionQueue};
pub use error::{MasterError, Result};
pub use heartbeat::SweepReport;
pub use router::{Command, Target};
pub use session::SessionState;

use dispatcher::FrameDispatcher;
use heartbeat::HeartbeatMonitor;
use router::CommandRouter;
use table::SessionTable;

// ============================================================================
// Default Parameters
// ============================================================================

/// Environment name handed to workers at INITIALIZE.
pub const ENVIRONMENT_NAME: &str = "BreakoutNoFrameskip-v4";

/// Protocol/server version reported in NameResponse.
pub const SERVER_VERSION: i32 = 1;

/// Environment slots served by the master.
pub const NUMBER_OF_ENVIRONMENTS: usize = 8;

/// Ingestion queue capacity, in frames.
pub const INGESTION_CAPACITY: usize = 256;

/// Longest a frame handler waits on a full ingestion queue.
pub const ENQUEUE_WAIT_MS: u64 = 1;

/// Silence after which a session is evicted.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Period of the heartbeat sweep.
pub const SWEEP_INTERVAL_MS: u64 = 5_000;

/// Additional silence after which an evicted session is dropped outright.
pub const EVICTION_GRACE_MS: u64 = 30_000;

// ============================================================================
// Configuration
// ============================================================================

/// Master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub environment_name: String,
    /// Per-client seed is `seed + client_id`.
    pub seed: i32,
    pub server_version: i32,
    pub number_of_environments: usize,
    pub ingestion_capacity: usize,
    pub enqueue_wait_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub eviction_grace_ms: u64,
    /// Queue depth below which lagging sessions get OK_ENCOURAGE.
    pub encourage_watermark: usize,
    /// Tell workers to answer a RESET right after a reset with the cached frame.
    pub reset_compensation: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            environment_name: ENVIRONMENT_NAME.to_string(),
            seed: 0,
            server_version: SERVER_VERSION,
            number_of_environments: NUMBER_OF_ENVIRONMENTS,
            ingestion_capacity: INGESTION_CAPACITY,
            enqueue_wait_ms: ENQUEUE_WAIT_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            eviction_grace_ms: EVICTION_GRACE_MS,
            // Less than one batch queued means the loop is under-fed.
            encourage_watermark: NUMBER_OF_ENVIRONMENTS,
            reset_compensation: false,
        }
    }
}

impl MasterConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }
}

// ============================================================================
// Master
// ============================================================================

/// Master-side session and flow-control engine.
///
/// `Master` is `Send + Sync`; share it behind an `Arc` between connection
/// handlers and the training loop.
pub struct Master {
    config: MasterConfig,
    table: Arc<SessionTable>,
    dispatcher: FrameDispatcher,
    router: CommandRouter,
}

impl Master {
    /// Create a new master with the given configuration.
    pub fn new(config: MasterConfig) -> Self {
        let table = Arc::new(SessionTable::new(config.number_of_environments));
        let dispatcher = FrameDispatcher::new(
            config.ingestion_capacity.max(1),
            config.enqueue_wait(),
            config.encourage_watermark,
        );
        let router = CommandRouter::new(Arc::clone(&table));

        Self {
            config,
            table,
            dispatcher,
            router,
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Answer one worker request.
    pub fn handle(&self, request: MasterRequest) -> MasterResponse {
        self.handle_at(request, Instant::now())
    }

    /// Answer one worker request as of `now`.
    pub fn handle_at(&self, request: MasterRequest, now: Instant) -> MasterResponse {
        let Ok(kind) = RequestCommand::try_from(request.command) else {
            warn!(
                client_id = request.client_id,
                command = request.command,
                "unknown request kind"
            );
            return MasterResponse::code(ResponseCode::Error);
        };

        match kind {
            RequestCommand::Initialize => self.handle_initialize(&request, now),
            RequestCommand::Close => self.handle_close(&request),
            RequestCommand::Connect | RequestCommand::Frame | RequestCommand::Heartbeat => {
                self.handle_session_request(kind, request, now)
            }
        }
    }

    /// Decode a request body, answer it, and encode the response.
    ///
    /// Undecodable bodies are answered ERROR.
    pub fn handle_bytes(&self, body: &[u8]) -> Vec<u8> {
        let response = match vecfarm_wire::decode_request(body) {
            Ok(request) => self.handle(request),
            Err(e) => {
                let e = MasterError::from(e);
                warn!(error = %e, "dropping undecodable request");
                MasterResponse::code(ResponseCode::Error)
            }
        };
        vecfarm_wire::encode_response(&response)
    }

    /// Queue `command` for delivery on the addressed session(s)' next response.
    pub fn submit(&self, target: Target, command: Command) -> Result<usize> {
        self.router.submit(target, command)
    }

    /// Non-blocking pop from the ingestion queue.
    pub fn pop(&self) -> Option<(ClientId, Frame)> {
        self.dispatcher.pop()
    }

    /// Consumer handle for the training loop.
    pub fn ingestion_queue(&self) -> IngestionQueue {
        self.dispatcher.queue()
    }

    pub fn queue_len(&self) -> usize {
        self.dispatcher.len()
    }

    /// Release a session from the master side.
    pub fn close(&self, client_id: ClientId) -> bool {
        self.table.remove(client_id)
    }

    /// Run one heartbeat sweep as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        self.heartbeat_monitor().sweep(now)
    }

    /// Spawn the periodic heartbeat sweep on the current tokio runtime.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        self.heartbeat_monitor().spawn(self.config.sweep_interval())
    }

    fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            Arc::clone(&self.table),
            self.config.heartbeat_timeout(),
            self.config.eviction_grace(),
        )
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    pub fn session_state(&self, client_id: ClientId) -> Option<SessionState> {
        self.table.lookup(client_id).map(|h| h.lock().state)
    }

    pub fn environment_id(&self, client_id: ClientId) -> Option<i32> {
        self.table
            .lookup(client_id)
            .and_then(|h| h.lock().environment_id)
    }

    pub fn spaces(&self, client_id: ClientId) -> Option<Vec<u8>> {
        self.table
            .lookup(client_id)
            .and_then(|h| h.lock().spaces.clone())
    }

    pub fn last_nonce(&self, client_id: ClientId) -> Option<Nonce> {
        self.table.lookup(client_id).map(|h| h.lock().last_nonce)
    }

    /// Number of environment slots currently bound to a session.
    pub fn bound_environments(&self) -> usize {
        self.table.bound_slots()
    }
}

// ============================================================================
// Tests
// ============================================================================
