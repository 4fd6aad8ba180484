//! Command routing from the training loop to sessions.
//!
//! Each session holds at most one pending command. A new command for a
//! session that already has one overwrites it; workers step in lockstep with
//! the master so there is never a backlog worth keeping.

use std::sync::Arc;

use tracing::debug;
use vecfarm_wire::{ClientId, CommandKind, InstanceId, Nonce, WorkerCommand};

use crate::error::{MasterError, Result};
use crate::session::SessionState;
use crate::table::SessionTable;

/// Instruction produced by the training loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Advance the environment with the given opaque action bytes.
    Step { actions: Vec<u8> },
    /// Reset the environment and report the first frame.
    Reset,
    /// Shut the worker down.
    Close,
    /// Pull an idle worker back into the connection loop.
    WakeUp,
    /// Tear down the worker's registration; it must re-run INITIALIZE.
    ResetClient,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Step { .. } => CommandKind::Step,
            Self::Reset => CommandKind::Reset,
            Self::Close => CommandKind::Close,
            Self::WakeUp => CommandKind::WakeUp,
            Self::ResetClient => CommandKind::ResetClient,
        }
    }

    /// Wire form, stamped with the frame nonce expected in reply.
    pub fn into_wire(self, nonce: Nonce, instance_id: InstanceId) -> WorkerCommand {
        let kind = self.kind();
        let actions = match self {
            Self::Step { actions } => actions,
            _ => Vec::new(),
        };
        WorkerCommand {
            command: kind.into(),
            nonce,
            actions,
            instance_id,
        }
    }

    /// NO_COMMAND placeholder.
    pub fn no_command(nonce: Nonce, instance_id: InstanceId) -> WorkerCommand {
        WorkerCommand {
            command: CommandKind::NoCommand.into(),
            nonce,
            actions: Vec::new(),
            instance_id,
        }
    }
}

/// Addressee of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Client(ClientId),
    /// Every live session.
    All,
}

/// Deposits commands into session slots.
pub struct CommandRouter {
    table: Arc<SessionTable>,
}

impl CommandRouter {
    pub fn new(table: Arc<SessionTable>) -> Self {
        Self { table }
    }

    /// Make `command` the pending command of the addressed session(s).
    ///
    /// Returns the number of sessions that received it. Addressing a single
    /// client with no live session fails with `UnknownClient`.
    pub fn submit(&self, target: Target, command: Command) -> Result<usize> {
        match target {
            Target::Client(client_id) => {
                let handle = self
                    .table
                    .lookup(client_id)
                    .ok_or(MasterError::UnknownClient { client_id })?;
                let mut session = handle.lock();
                if session.state == SessionState::Closed {
                    return Err(MasterError::UnknownClient { client_id });
                }
                if let Some(previous) = session.pending_command.replace(command) {
                    debug!(client_id, overwritten = ?previous.kind(), "pending command replaced");
                }
                Ok(1)
            }
            Target::All => {
                let mut delivered = 0;
                for (client_id, handle) in self.table.snapshot() {
                    let mut session = handle.lock();
                    if session.state == SessionState::Closed {
                        continue;
                    }
                    if let Some(previous) = session.pending_command.replace(command.clone()) {
                        debug!(client_id, overwritten = ?previous.kind(), "pending command replaced");
                    }
                    delivered += 1;
                }
                debug!(kind = ?command.kind(), delivered, "broadcast command");
                Ok(delivered)
            }
        }
    }
}
