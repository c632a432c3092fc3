//! Codecs for transforming message payloads into and from binary form.
//!
//! Protocol payloads and the arguments built by the typed
//! [Call](crate::Call) constructors are encoded with the [Default](struct@Default)
//! codec. Results and arguments stay opaque [Bytes] for the core; only
//! the caller and the executing function interpret them.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    error::Error,
    fmt,
    io::{Read, Write},
    sync::Arc,
};

mod json;

pub use json::Json;

/// The codec used for protocol payloads.
#[doc(no_inline)]
pub use json::Json as Default;

/// Reference counted error that is send, sync, static and clone.
pub type ArcError = Arc<dyn Error + Send + Sync + 'static>;

/// Serialization error.
#[derive(Debug, Clone)]
pub struct SerializationError(pub ArcError);

impl SerializationError {
    /// Creates a new serialization error.
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl Error for SerializationError {}

/// Deserialization error.
#[derive(Debug, Clone)]
pub struct DeserializationError(pub ArcError);

impl DeserializationError {
    /// Creates a new deserialization error.
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }
}

impl fmt::Display for DeserializationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl Error for DeserializationError {}

/// Serializes and deserializes items from and to byte data.
pub trait Codec: Send + Sync + Clone + Unpin + 'static {
    /// Serializes the specified item into the data format.
    fn serialize<Writer, Item>(writer: Writer, item: &Item) -> Result<(), SerializationError>
    where
        Writer: Write,
        Item: Serialize;

    /// Deserializes the specified data into an item.
    fn deserialize<Reader, Item>(reader: Reader) -> Result<Item, DeserializationError>
    where
        Reader: Read,
        Item: DeserializeOwned;
}

/// Encodes an item with the specified codec.
pub fn encode_with<C, Item>(item: &Item) -> Result<Bytes, SerializationError>
where
    C: Codec,
    Item: Serialize,
{
    let mut writer = BytesMut::new().writer();
    C::serialize(&mut writer, item)?;
    Ok(writer.into_inner().freeze())
}

/// Decodes an item with the specified codec.
pub fn decode_with<C, Item>(data: &[u8]) -> Result<Item, DeserializationError>
where
    C: Codec,
    Item: DeserializeOwned,
{
    C::deserialize(data)
}

/// Encodes an item with the default codec.
pub fn encode<Item>(item: &Item) -> Result<Bytes, SerializationError>
where
    Item: Serialize,
{
    encode_with::<Default, _>(item)
}

/// Decodes an item with the default codec.
pub fn decode<Item>(data: &[u8]) -> Result<Item, DeserializationError>
where
    Item: DeserializeOwned,
{
    decode_with::<Default, _>(data)
}
