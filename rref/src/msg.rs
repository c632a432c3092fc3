//! Messages exchanged between workers.
//!
//! A frame on the wire consists of a one byte message type, the
//! little-endian 64-bit correlation id and the payload.
//! Payload bodies are encoded using the [default codec](crate::codec::Default).

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{self, ErrorKind};

use crate::{
    call::Call,
    codec::{self, DeserializationError, SerializationError},
    ForkId, RRefId, RpcError, WorkerInfo,
};

/// Length of the frame header in bytes.
pub const HEADER_LENGTH: usize = 9;

macro_rules! message_types {
    ($($(#[$attr:meta])* $name:ident = $value:literal,)*) => {
        /// Type of a message.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($(#[$attr])* $name = $value,)*
        }

        impl MessageType {
            fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$name),)*
                    _ => None,
                }
            }
        }
    };
}

message_types! {
    /// Call of a builtin operator.
    BuiltinCall = 1,
    /// Result of a builtin operator call.
    BuiltinRet = 2,
    /// Call of a precompiled function.
    ScriptCall = 3,
    /// Result of a precompiled function call.
    ScriptRet = 4,
    /// Call of a generic user function.
    PythonCall = 5,
    /// Result of a generic user function call.
    PythonRet = 6,
    /// Call whose result is stored on the destination and referenced by an RRef.
    RemoteCall = 7,
    /// Owner accepted the RRef and fork of a remote call.
    RemoteRet = 8,
    /// Request for the value of an RRef.
    RRefFetchCall = 9,
    /// Value of an RRef.
    RRefFetchRet = 10,
    /// A user dropped its fork.
    RRefUserDelete = 11,
    /// Registration of a fork with the owner.
    RRefForkRequest = 12,
    /// A child fork has been registered with the owner.
    RRefChildAccept = 13,
    /// Owner accepted a fork.
    RRefAck = 14,
    /// Arrival at a barrier.
    Barrier = 15,
    /// The sending worker is shutting down.
    Shutdown = 16,
    /// Generic acknowledgement.
    Ack = 17,
    /// The request failed; the payload is an encoded [RpcError].
    Exception = 18,
}

impl MessageType {
    /// True, if this is a response to a request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::BuiltinRet
                | Self::ScriptRet
                | Self::PythonRet
                | Self::RemoteRet
                | Self::RRefFetchRet
                | Self::RRefAck
                | Self::Ack
                | Self::Exception
        )
    }

    /// True, if this is a call initiated by the user, as opposed to a
    /// message of the reference counting or control protocol.
    pub fn is_user_call(self) -> bool {
        matches!(self, Self::BuiltinCall | Self::ScriptCall | Self::PythonCall | Self::RemoteCall)
    }
}

/// A request or response exchanged between workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Correlation id matching a response to its request.
    pub id: u64,
    /// Message type.
    pub kind: MessageType,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message with the specified payload.
    ///
    /// The correlation id is assigned by the agent when sending.
    pub fn new(kind: MessageType, payload: Bytes) -> Self {
        Self { id: 0, kind, payload }
    }

    /// Creates a message with an encoded payload.
    pub fn encode<T>(kind: MessageType, body: &T) -> Result<Self, SerializationError>
    where
        T: Serialize,
    {
        Ok(Self::new(kind, codec::encode(body)?))
    }

    /// Decodes the payload.
    pub fn decode<T>(&self) -> Result<T, DeserializationError>
    where
        T: DeserializeOwned,
    {
        codec::decode(&self.payload)
    }

    /// Creates an empty acknowledgement.
    pub fn ack() -> Self {
        Self::new(MessageType::Ack, Bytes::new())
    }

    /// Creates an exception response carrying the error.
    pub fn exception(err: &RpcError) -> Self {
        match codec::encode(err) {
            Ok(payload) => Self::new(MessageType::Exception, payload),
            Err(ser_err) => {
                tracing::warn!(%err, %ser_err, "encoding exception failed");
                let fallback = RpcError::Serialization(ser_err.to_string());
                Self::new(MessageType::Exception, codec::encode(&fallback).unwrap_or_default())
            }
        }
    }

    /// Decodes the error of an exception response.
    pub fn to_error(&self) -> RpcError {
        match self.decode::<RpcError>() {
            Ok(err) => err,
            Err(err) => RpcError::Deserialization(format!("undecodable exception: {}", err)),
        }
    }

    /// Returns the payload if the message has the expected type.
    ///
    /// An exception is converted into its error.
    pub fn expect(self, kind: MessageType) -> Result<Bytes, RpcError> {
        if self.kind == kind {
            Ok(self.payload)
        } else if self.kind == MessageType::Exception {
            Err(self.to_error())
        } else {
            Err(RpcError::Protocol(format!("expected {:?} but received {:?}", kind, self.kind)))
        }
    }

    /// Writes the message into a frame.
    pub fn write(&self) -> Bytes {
        let mut writer = BytesMut::with_capacity(HEADER_LENGTH + self.payload.len()).writer();
        writer.write_u8(self.kind as u8).expect("writing to memory cannot fail");
        writer.write_u64::<LE>(self.id).expect("writing to memory cannot fail");
        let mut buf = writer.into_inner();
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Reads a message from a frame.
    pub fn read(mut frame: Bytes) -> Result<Self, io::Error> {
        if frame.len() < HEADER_LENGTH {
            return Err(io::Error::new(ErrorKind::InvalidData, "frame shorter than message header"));
        }
        let mut header = &frame[..HEADER_LENGTH];
        let kind = header.read_u8()?;
        let kind = MessageType::from_u8(kind)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, format!("invalid message type {}", kind)))?;
        let id = header.read_u64::<LE>()?;
        let payload = frame.split_off(HEADER_LENGTH);
        Ok(Self { id, kind, payload })
    }
}

/// Payload of a [MessageType::RemoteCall].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteCall {
    /// Call whose result becomes the value of the RRef.
    pub call: Call,
    /// Id of the RRef.
    pub rref_id: RRefId,
    /// Fork of the caller.
    pub fork_id: ForkId,
}

/// Payload of [MessageType::RemoteRet], [MessageType::RRefForkRequest],
/// [MessageType::RRefAck] and [MessageType::RRefUserDelete].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkMsg {
    /// Id of the RRef.
    pub rref_id: RRefId,
    /// Fork being registered or deleted.
    pub fork_id: ForkId,
}

/// Payload of a [MessageType::RRefFetchCall].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCall {
    /// Id of the RRef.
    pub rref_id: RRefId,
}

/// Payload of a [MessageType::RRefChildAccept].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildAccept {
    /// Id of the RRef.
    pub rref_id: RRefId,
    /// Fork of the child that has been registered with the owner.
    pub fork_id: ForkId,
}

/// Kind of barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarrierKind {
    /// Barrier of [RpcAgent::sync](crate::agent::RpcAgent::sync).
    Sync,
    /// Barrier of [RpcAgent::join](crate::agent::RpcAgent::join).
    Join,
}

/// Payload of a [MessageType::Barrier].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BarrierMsg {
    /// Barrier kind.
    pub kind: BarrierKind,
    /// Per-worker counter of barriers of this kind.
    pub round: u64,
}

/// Payload of a [MessageType::Shutdown].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownMsg {
    /// Worker that is shutting down.
    pub worker: WorkerInfo,
}
