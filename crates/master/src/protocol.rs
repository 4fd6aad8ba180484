//! Per-session protocol state machine.
//!
//! ```text
//! UNINITIALIZED --INITIALIZE--> CONNECTED --CONNECT--> STREAMING --FRAME--> STREAMING
//!                                    any --CLOSE / eviction--> CLOSED
//!                     STREAMING --RESET_CLIENT delivered--> RESETTING --INITIALIZE--> CONNECTED
//! ```
//!
//! Every request gets exactly one response code. Failures are confined to
//! the session that caused them.

use std::time::Instant;

use tracing::{debug, info, warn};
use vecfarm_wire::{
    ClientId, CommandKind, ConnectResponse, MasterRequest, MasterResponse, NameResponse,
    RequestCommand, ResponseCode, master_request::Payload,
};

use crate::Master;
use crate::dispatcher::{Dispatch, Frame};
use crate::session::{Session, SessionRef, SessionState};

/// Legality of a request kind in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Reject(ResponseCode),
}

/// Decide whether `kind` may run against a session in `state`.
///
/// A `Reject(Reset)` also means the session is to be removed.
pub fn gate(state: SessionState, kind: RequestCommand) -> Gate {
    use RequestCommand as R;
    use SessionState as S;

    match (state, kind) {
        (_, R::Close) => Gate::Proceed,

        // Spaces are immutable once set; a live worker must reset itself.
        (S::Uninitialized | S::Connected | S::Streaming, R::Initialize) => {
            Gate::Reject(ResponseCode::Error)
        }
        (S::Resetting | S::Closed, R::Initialize) => Gate::Proceed,

        (S::Connected, R::Connect) => Gate::Proceed,
        (S::Streaming, R::Frame) => Gate::Proceed,
        (S::Uninitialized | S::Connected | S::Streaming, R::Heartbeat) => Gate::Proceed,

        (S::Resetting, _) => Gate::Reject(ResponseCode::Reset),
        // In flight while the session was closed underneath it.
        (S::Closed, _) => Gate::Reject(ResponseCode::Error),
        // FRAME before CONNECT, CONNECT twice, CONNECT before INITIALIZE.
        (S::Uninitialized | S::Connected | S::Streaming, _) => Gate::Reject(ResponseCode::Error),
    }
}

impl Master {
    pub(crate) fn handle_initialize(&self, request: &MasterRequest, now: Instant) -> MasterResponse {
        let requested = request.client_id;

        if requested != 0 {
            if let Some(handle) = self.table.lookup(requested) {
                let session = handle.lock();
                let expired = session.is_expired(now, self.config.heartbeat_timeout());
                if !expired {
                    if let Gate::Reject(code) = gate(session.state, RequestCommand::Initialize) {
                        warn!(
                            client_id = requested,
                            state = ?session.state,
                            "INITIALIZE on a live session rejected"
                        );
                        return MasterResponse::code(code);
                    }
                }
            }
        }

        let client_id = if self.table.was_issued(requested) {
            requested
        } else {
            self.table.issue_client_id()
        };

        let handle = self.table.register(client_id, now);
        let mut session = handle.lock();
        if session.state == SessionState::Closed {
            // A concurrent registration for the same id replaced this one.
            warn!(client_id, "INITIALIZE lost a race for its client id");
            return MasterResponse::code(ResponseCode::Error);
        }
        session.state = SessionState::Connected;

        info!(client_id, instance_id = session.instance_id, "assigned client id");

        MasterResponse::with_name(NameResponse {
            name: self.config.environment_name.clone(),
            seed: self.config.seed.wrapping_add(client_id),
            server_version: self.config.server_version,
            client_id,
            instance_id: session.instance_id,
            reset_compensation: self.config.reset_compensation,
        })
    }

    pub(crate) fn handle_close(&self, request: &MasterRequest) -> MasterResponse {
        if let Some(handle) = self.table.lookup(request.client_id) {
            let mut session = handle.lock();
            if session.instance_id == request.instance_id {
                self.table.retire(&handle, &mut session);
                info!(client_id = request.client_id, "worker closed session");
            } else {
                debug!(
                    client_id = request.client_id,
                    "CLOSE from stale generation ignored"
                );
            }
        }
        MasterResponse::code(ResponseCode::Ok)
    }

    /// CONNECT, FRAME and HEARTBEAT: requests addressed to an existing session.
    pub(crate) fn handle_session_request(
        &self,
        kind: RequestCommand,
        request: MasterRequest,
        now: Instant,
    ) -> MasterResponse {
        let client_id = request.client_id;

        let Some(handle) = self.table.lookup(client_id) else {
            if kind == RequestCommand::Connect && self.table.was_issued(client_id) {
                return self.handle_reconnect(request, now);
            }
            debug!(client_id, ?kind, "no session, telling worker to reset");
            return MasterResponse::code(ResponseCode::Reset);
        };

        let mut session = handle.lock();

        if session.state == SessionState::Closed {
            return MasterResponse::code(ResponseCode::Error);
        }

        if session.instance_id != request.instance_id {
            warn!(
                client_id,
                expected = session.instance_id,
                got = request.instance_id,
                "request from stale generation"
            );
            return MasterResponse::code(ResponseCode::Reset);
        }

        if session.is_expired(now, self.config.heartbeat_timeout()) {
            info!(client_id, "evicting silent session");
            self.table.retire(&handle, &mut session);
            return MasterResponse::code(ResponseCode::Reset);
        }

        match gate(session.state, kind) {
            Gate::Proceed => {}
            Gate::Reject(ResponseCode::Reset) => {
                info!(client_id, state = ?session.state, "session reset");
                self.table.retire(&handle, &mut session);
                return MasterResponse::code(ResponseCode::Reset);
            }
            Gate::Reject(code) => {
                warn!(client_id, state = ?session.state, ?kind, "illegal request");
                return MasterResponse::code(code);
            }
        }

        session.touch(now);

        match kind {
            RequestCommand::Connect => self.handle_connect(&handle, &mut session, request),
            RequestCommand::Frame => self.handle_frame(&handle, &mut session, request),
            _ => self.deliver(&handle, &mut session, ResponseCode::Ok),
        }
    }

    /// CONNECT from a previously issued client id whose session is gone.
    ///
    /// The fresh session only survives if the worker learns its instance id,
    /// so any outcome other than OK / OK_ENCOURAGE retires it again.
    fn handle_reconnect(&self, request: MasterRequest, now: Instant) -> MasterResponse {
        let client_id = request.client_id;
        let handle = self.table.register(client_id, now);
        let mut session = handle.lock();
        if session.state == SessionState::Closed {
            debug!(client_id, "reconnect lost a race for its client id");
            return MasterResponse::code(ResponseCode::Reset);
        }
        session.state = SessionState::Connected;

        let response = self.handle_connect(&handle, &mut session, request);
        if !matches!(
            response.response(),
            ResponseCode::Ok | ResponseCode::OkEncourage
        ) {
            debug!(client_id, code = ?response.response(), "reconnect not admitted");
            self.table.retire(&handle, &mut session);
        }
        response
    }

    fn handle_connect(
        &self,
        handle: &SessionRef,
        session: &mut Session,
        request: MasterRequest,
    ) -> MasterResponse {
        let client_id = session.client_id;
        let Some(Payload::Connect(connect)) = request.payload else {
            warn!(client_id, "CONNECT without spaces payload");
            return MasterResponse::code(ResponseCode::Error);
        };

        if session.environment_id.is_none() {
            match self.table.bind_slot(client_id) {
                Some(environment_id) => session.environment_id = Some(environment_id),
                None => {
                    debug!(client_id, "all environment slots taken");
                    return MasterResponse::code(ResponseCode::Wait);
                }
            }
        }

        session.spaces = Some(connect.spaces);
        session.state = SessionState::Streaming;
        session.last_nonce = 0;
        self.table.record_progress(client_id, 0);

        info!(
            client_id,
            environment_id = session.environment_id_or_unbound(),
            "session streaming"
        );

        // A worker joining a farm that is already stepping should not wait
        // for the next cadence.
        let code = self
            .dispatcher
            .admission_for(session.last_nonce, self.table.leading_nonce());
        self.deliver(handle, session, code)
    }

    fn handle_frame(
        &self,
        handle: &SessionRef,
        session: &mut Session,
        request: MasterRequest,
    ) -> MasterResponse {
        let client_id = session.client_id;
        let Some(Payload::Frame(wire_frame)) = request.payload else {
            warn!(client_id, "FRAME without frame payload");
            return MasterResponse::code(ResponseCode::Error);
        };

        if wire_frame.nonce != session.expected_nonce() {
            debug!(
                client_id,
                expected = session.expected_nonce(),
                got = wire_frame.nonce,
                "out-of-order frame discarded"
            );
            return MasterResponse::code(ResponseCode::SoftError);
        }

        let frame = match Frame::try_from(wire_frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client_id, error = %e, "malformed frame");
                return MasterResponse::code(ResponseCode::Error);
            }
        };

        let nonce = frame.nonce;
        let digest = frame.observation.digest_hex();
        match self.dispatcher.dispatch(client_id, frame) {
            Ok(Dispatch::Accepted { depth }) => {
                session.last_nonce = nonce;
                self.table.record_progress(client_id, nonce);
                debug!(client_id, nonce, depth, observation = %digest, "frame accepted");
                let code = self
                    .dispatcher
                    .admission_for(session.last_nonce, self.table.leading_nonce());
                self.deliver(handle, session, code)
            }
            Ok(Dispatch::Saturated) => MasterResponse::code(ResponseCode::Wait),
            Err(e) => {
                warn!(client_id, error = %e, "frame could not be dispatched");
                MasterResponse::code(ResponseCode::Error)
            }
        }
    }

    /// Build an accepting response, handing over the pending command.
    fn deliver(&self, handle: &SessionRef, session: &mut Session, code: ResponseCode) -> MasterResponse {
        let command = session.take_command();
        let kind = command.command();
        let client_id: ClientId = session.client_id;

        let response = MasterResponse::with_connect(
            code,
            ConnectResponse {
                environment_id: session.environment_id_or_unbound(),
                last_command: Some(command),
            },
        );

        match kind {
            CommandKind::NoCommand => {}
            CommandKind::ResetClient => {
                session.state = SessionState::Resetting;
                self.table.clear_progress(client_id);
                info!(client_id, "RESET_CLIENT delivered");
            }
            CommandKind::Close => {
                self.table.retire(handle, session);
                info!(client_id, "CLOSE delivered, session released");
            }
            _ => debug!(client_id, ?kind, "command delivered"),
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_always_proceeds() {
        for state in [
            SessionState::Uninitialized,
            SessionState::Connected,
            SessionState::Streaming,
            SessionState::Resetting,
            SessionState::Closed,
        ] {
            assert_eq!(gate(state, RequestCommand::Close), Gate::Proceed);
        }
    }

    #[test]
    fn test_initialize_rejected_on_live_session() {
        assert_eq!(
            gate(SessionState::Streaming, RequestCommand::Initialize),
            Gate::Reject(ResponseCode::Error)
        );
        assert_eq!(
            gate(SessionState::Connected, RequestCommand::Initialize),
            Gate::Reject(ResponseCode::Error)
        );
        assert_eq!(
            gate(SessionState::Resetting, RequestCommand::Initialize),
            Gate::Proceed
        );
    }

    #[test]
    fn test_frame_only_legal_while_streaming() {
        assert_eq!(gate(SessionState::Streaming, RequestCommand::Frame), Gate::Proceed);
        assert_eq!(
            gate(SessionState::Connected, RequestCommand::Frame),
            Gate::Reject(ResponseCode::Error)
        );
        assert_eq!(
            gate(SessionState::Resetting, RequestCommand::Frame),
            Gate::Reject(ResponseCode::Reset)
        );
        assert_eq!(
            gate(SessionState::Closed, RequestCommand::Frame),
            Gate::Reject(ResponseCode::Error)
        );
    }

    #[test]
    fn test_connect_only_from_connected() {
        assert_eq!(gate(SessionState::Connected, RequestCommand::Connect), Gate::Proceed);
        assert_eq!(
            gate(SessionState::Streaming, RequestCommand::Connect),
            Gate::Reject(ResponseCode::Error)
        );
    }

    #[test]
    fn test_heartbeat_legal_in_any_live_state() {
        for state in [
            SessionState::Uninitialized,
            SessionState::Connected,
            SessionState::Streaming,
        ] {
            assert_eq!(gate(state, RequestCommand::Heartbeat), Gate::Proceed);
        }
        assert_eq!(
            gate(SessionState::Resetting, RequestCommand::Heartbeat),
            Gate::Reject(ResponseCode::Reset)
        );
    }
}
