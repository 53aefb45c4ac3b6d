//! Packet framing.
//!
//! A packet is `{"name": <string>, "contents": [<json>, ...]}`. On the wire it
//! travels as a 4-byte big-endian unsigned length followed by that many bytes
//! of UTF-8 JSON. Serialization is explicit JSON so every peer, regardless of
//! build, agrees on the byte layout.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ReverbError;

/// Spawn-or-update batch, server to clients.
pub const SERVER_SYNC: &str = "server_sync";
/// Despawn notice, server to clients.
pub const REMOVE_RO: &str = "remove_ro";
/// Orderly shutdown notice, server to clients.
pub const SERVER_STOP: &str = "server_stop";
/// Remote method request against a server-side object.
pub const CALLING_SERVER_COMPUTING: &str = "calling_server_computing";
/// Remote method request against client-side replicas.
pub const CALLING_CLIENT_COMPUTING: &str = "calling_client_computing";
/// Graceful leave notice, client to server.
pub const CLIENT_DISCONNECTION: &str = "client_disconnection";

/// One wire message: an event name plus its positional contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub name: String,
    pub contents: Vec<Value>,
}

impl Packet {
    pub fn new(name: impl Into<String>, contents: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            contents,
        }
    }

    /// Encodes the packet with its length header, ready to write.
    pub fn encode_frame(&self) -> Result<Bytes, ReverbError> {
        let body = serde_json::to_vec(self)
            .map_err(|e| ReverbError::NotSerializable(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Decodes a frame body. Zero-length bodies, broken JSON and bodies
    /// missing `name` or `contents` are all `MalformedPacket`.
    pub fn decode(body: &[u8]) -> Result<Self, ReverbError> {
        serde_json::from_slice(body).map_err(|e| ReverbError::MalformedPacket(e.to_string()))
    }
}

/// Converts an application value into a wire value, rejecting anything JSON
/// cannot represent before it reaches a send path.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, ReverbError> {
    serde_json::to_value(value).map_err(|e| ReverbError::NotSerializable(e.to_string()))
}

/// Splits remote-call contents into `(uid, method, args)`.
pub fn parse_remote_call(contents: &[Value]) -> Option<(&str, &str, &[Value])> {
    let uid = contents.first()?.as_str()?;
    let method = contents.get(1)?.as_str()?;
    Some((uid, method, contents.get(2..).unwrap_or(&[])))
}
