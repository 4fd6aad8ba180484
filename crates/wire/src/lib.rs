//! vecfarm Wire Protocol Types
//!
//! This crate defines the shared Protobuf message types exchanged between
//! environment workers and the master. Workers and master MUST both depend on
//! this crate so the schema cannot drift.
//!
//! # Message Categories
//!
//! - **Requests** (worker → master): `MasterRequest` envelope with a command
//!   kind and an optional payload (`ConnectRequest` or `Frame`).
//! - **Responses** (master → worker): `MasterResponse` envelope with a
//!   response code and an optional payload (`ConnectResponse` or
//!   `NameResponse`).
//! - **Commands** (master → worker): `WorkerCommand`, carried inside
//!   `ConnectResponse.last_command`.
//!
//! Length-prefixed framing is the transport's job; this crate only deals
//! with message bodies.

#![deny(unsafe_code)]

use prost::Message;

// ============================================================================
// Type Aliases
// ============================================================================

/// Master-assigned worker identifier. 0 means "not yet assigned".
pub type ClientId = i32;

/// Environment generation under a client id.
pub type InstanceId = i64;

/// Per-session frame sequence counter.
pub type Nonce = i64;

// ============================================================================
// Arrays
// ============================================================================

/// Numeric array on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct ArrayProto {
    /// Raw element bytes, row-major.
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,

    /// Dimension sizes.
    #[prost(int32, repeated, tag = "2")]
    pub shape: Vec<i32>,

    /// Element type tag, e.g. "float32".
    #[prost(string, tag = "3")]
    pub dtype: String,
}

// ============================================================================
// Requests
// ============================================================================

/// Request kinds a worker can issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RequestCommand {
    Initialize = 0,
    Connect = 1,
    Frame = 2,
    Heartbeat = 3,
    Close = 4,
}

/// Request envelope.
#[derive(Clone, PartialEq, Message)]
pub struct MasterRequest {
    #[prost(enumeration = "RequestCommand", tag = "1")]
    pub command: i32,

    /// 0 on the very first INITIALIZE.
    #[prost(int32, tag = "2")]
    pub client_id: ClientId,

    /// Generation the worker believes it belongs to.
    #[prost(int64, tag = "3")]
    pub instance_id: InstanceId,

    #[prost(oneof = "master_request::Payload", tags = "4, 5")]
    pub payload: Option<master_request::Payload>,
}

pub mod master_request {
    /// Request payload, keyed by the request kind.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "4")]
        Connect(super::ConnectRequest),

        #[prost(message, tag = "5")]
        Frame(super::Frame),
    }
}

/// CONNECT payload.
#[derive(Clone, PartialEq, Message)]
pub struct ConnectRequest {
    /// Opaque serialized observation/action-space descriptor.
    #[prost(bytes = "vec", tag = "1")]
    pub spaces: Vec<u8>,
}

/// One observation emission from a worker.
#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(message, optional, tag = "1")]
    pub observation: Option<ArrayProto>,

    #[prost(double, tag = "2")]
    pub reward: f64,

    /// Episode-termination flag.
    #[prost(bool, tag = "3")]
    pub done: bool,

    /// Opaque auxiliary bytes, passed through untouched.
    #[prost(bytes = "vec", tag = "4")]
    pub info: Vec<u8>,

    #[prost(int64, tag = "5")]
    pub nonce: Nonce,
}

// ============================================================================
// Responses
// ============================================================================

/// Response codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseCode {
    Ok = 0,
    /// Hard failure: worker resets itself and re-runs INITIALIZE.
    Error = 1,
    /// Server busy: retry the same request later.
    Wait = 2,
    /// Recoverable mismatch: retry with corrected state, no reset.
    SoftError = 3,
    /// Unregister and re-enter the connection queue.
    Reset = 4,
    /// Accepted; send the next frame without waiting for the usual cadence.
    OkEncourage = 5,
}

/// Response envelope.
#[derive(Clone, PartialEq, Message)]
pub struct MasterResponse {
    #[prost(enumeration = "ResponseCode", tag = "1")]
    pub response: i32,

    #[prost(oneof = "master_response::Payload", tags = "2, 3")]
    pub payload: Option<master_response::Payload>,
}

pub mod master_response {
    /// Response payload.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        Connect(super::ConnectResponse),

        #[prost(message, tag = "3")]
        Name(super::NameResponse),
    }
}

/// Reply to CONNECT, and the carrier for commands on later replies.
#[derive(Clone, PartialEq, Message)]
pub struct ConnectResponse {
    /// Environment slot bound to this session.
    #[prost(int32, tag = "1")]
    pub environment_id: i32,

    #[prost(message, optional, tag = "2")]
    pub last_command: Option<WorkerCommand>,
}

/// Reply to INITIALIZE.
#[derive(Clone, PartialEq, Message)]
pub struct NameResponse {
    /// Environment name the worker should instantiate.
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(int32, tag = "2")]
    pub seed: i32,

    #[prost(int32, tag = "3")]
    pub server_version: i32,

    #[prost(int32, tag = "4")]
    pub client_id: ClientId,

    #[prost(int64, tag = "5")]
    pub instance_id: InstanceId,

    /// Worker should answer a RESET right after a reset with the cached frame.
    #[prost(bool, tag = "6")]
    pub reset_compensation: bool,
}

impl MasterResponse {
    /// Response carrying only a code.
    pub fn code(code: ResponseCode) -> Self {
        Self {
            response: code.into(),
            payload: None,
        }
    }

    /// Response carrying a `ConnectResponse` payload.
    pub fn with_connect(code: ResponseCode, connect: ConnectResponse) -> Self {
        Self {
            response: code.into(),
            payload: Some(master_response::Payload::Connect(connect)),
        }
    }

    /// OK response carrying a `NameResponse` payload.
    pub fn with_name(name: NameResponse) -> Self {
        Self {
            response: ResponseCode::Ok.into(),
            payload: Some(master_response::Payload::Name(name)),
        }
    }

    /// The delivered command, if any.
    pub fn last_command(&self) -> Option<&WorkerCommand> {
        match &self.payload {
            Some(master_response::Payload::Connect(c)) => c.last_command.as_ref(),
            _ => None,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Command kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CommandKind {
    NoCommand = 0,
    Step = 1,
    Reset = 2,
    Close = 3,
    WakeUp = 4,
    ResetClient = 5,
}

/// Instruction from master to worker.
#[derive(Clone, PartialEq, Message)]
pub struct WorkerCommand {
    #[prost(enumeration = "CommandKind", tag = "1")]
    pub command: i32,

    /// Nonce the worker must put on the frame answering this command.
    #[prost(int64, tag = "2")]
    pub nonce: Nonce,

    /// Opaque action payload, present only for STEP.
    #[prost(bytes = "vec", tag = "3")]
    pub actions: Vec<u8>,

    /// Generation this command targets.
    #[prost(int64, tag = "4")]
    pub instance_id: InstanceId,
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl TryFrom<vecfarm_array::Array> for ArrayProto {
    type Error = vecfarm_array::CodecError;

    fn try_from(array: vecfarm_array::Array) -> Result<Self, Self::Error> {
        let (shape, dtype, data) = vecfarm_array::decode(array);
        let wire_shape = shape
            .iter()
            .map(|&d| i32::try_from(d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| vecfarm_array::CodecError::ShapeOverflow { shape })?;
        Ok(Self {
            data,
            shape: wire_shape,
            dtype: dtype.to_string(),
        })
    }
}

impl TryFrom<ArrayProto> for vecfarm_array::Array {
    type Error = vecfarm_array::CodecError;

    fn try_from(proto: ArrayProto) -> Result<Self, Self::Error> {
        let dims: Vec<i64> = proto.shape.iter().map(|&d| i64::from(d)).collect();
        vecfarm_array::encode(&dims, &proto.dtype, proto.data)
    }
}

/// Decode a request body.
pub fn decode_request(bytes: &[u8]) -> Result<MasterRequest, prost::DecodeError> {
    MasterRequest::decode(bytes)
}

/// Encode a response body.
pub fn encode_response(response: &MasterResponse) -> Vec<u8> {
    response.encode_to_vec()
}

// ============================================================================
// Tests
// ============================================================================
