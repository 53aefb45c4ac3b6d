//! Replicated objects.
//!
//! An object class declares an ordered list of sync cells; those positions are
//! the wire contract, so field count and order must match across peers for a
//! given type name. The base struct carries identity, the owner tag, liveness
//! and the outbound handle injected at registration time. Remote methods are
//! resolved by name in the class's `dispatch` implementation; there is no
//! reflection anywhere.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::codec::{Packet, CALLING_CLIENT_COMPUTING, CALLING_SERVER_COMPUTING};
use crate::errors::ReverbError;
use crate::net::NetHandle;
use crate::sync::SyncVar;
use crate::world::Side;

/// Sentinel uid carried by objects the server has not yet registered.
pub const UNKNOWN_UID: &str = "Unknown";

/// Name under which the abstract base is listed in every type registry. It is
/// never instantiated across the wire.
pub const BASE_TYPE_NAME: &str = "ReverbObject";

/// Identity and bookkeeping embedded in every replicated object.
#[derive(Debug)]
pub struct ObjectBase {
    uid: String,
    type_name: &'static str,
    owner_tag: Option<u16>,
    is_alive: bool,
    is_initialized: bool,
    net: Option<NetHandle>,
}

impl ObjectBase {
    pub fn new(type_name: &'static str, owner_tag: Option<u16>) -> Self {
        Self {
            uid: UNKNOWN_UID.to_string(),
            type_name,
            owner_tag,
            is_alive: true,
            is_initialized: false,
            net: None,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_uid_set(&self) -> bool {
        self.uid != UNKNOWN_UID
    }

    pub(crate) fn set_uid(&mut self, uid: String) {
        self.uid = uid;
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The port of the client this object logically belongs to, if any.
    pub fn owner_tag(&self) -> Option<u16> {
        self.owner_tag
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive
    }

    pub(crate) fn kill(&mut self) {
        self.is_alive = false;
    }

    /// Whether the object has been broadcast at least once. Controls full
    /// versus diff encoding in the tick.
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub(crate) fn set_initialized(&mut self) {
        self.is_initialized = true;
    }

    pub(crate) fn attach_net(&mut self, net: NetHandle) {
        self.net = Some(net);
    }

    pub(crate) fn net(&self) -> Option<&NetHandle> {
        self.net.as_ref()
    }

    /// Client-only: whether this replica belongs to the local client, i.e.
    /// the owner tag matches the local socket's ephemeral port.
    pub fn is_owner(&self) -> Result<bool, ReverbError> {
        match &self.net {
            Some(net) if net.side() == Side::Client => {
                Ok(self.owner_tag == Some(net.local_port()))
            }
            Some(net) => Err(ReverbError::WrongSide {
                expected: Side::Client,
                actual: net.side(),
            }),
            None => Ok(false),
        }
    }

    /// Client-only: requests that `method` run on the server against this
    /// object. Dead or unregistered objects drop the call.
    pub fn compute_server(&self, method: &str, args: Vec<Value>) -> Result<(), ReverbError> {
        self.compute(CALLING_SERVER_COMPUTING, Side::Client, method, args)
    }

    /// Server-only: requests that `method` run on every client's replica of
    /// this object.
    pub fn compute_client(&self, method: &str, args: Vec<Value>) -> Result<(), ReverbError> {
        self.compute(CALLING_CLIENT_COMPUTING, Side::Server, method, args)
    }

    fn compute(
        &self,
        packet_name: &'static str,
        expected: Side,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), ReverbError> {
        let Some(net) = &self.net else {
            debug!(uid = %self.uid, method, "object not attached to a transport; dropping call");
            return Ok(());
        };
        if net.side() != expected {
            return Err(ReverbError::WrongSide {
                expected,
                actual: net.side(),
            });
        }
        if !self.is_alive {
            debug!(uid = %self.uid, method, "object is dead; dropping call");
            return Ok(());
        }

        let mut contents = Vec::with_capacity(args.len() + 2);
        contents.push(Value::String(self.uid.clone()));
        contents.push(Value::String(method.to_string()));
        contents.extend(args);
        net.send(Packet::new(packet_name, contents));
        Ok(())
    }
}

/// Behavior every replicated object class implements.
///
/// `fields` and `fields_mut` must return the same cells in the same order
/// every call; that order is what travels on the wire. Lifecycle hooks are
/// overridable no-ops, each invoked by the framework in a fresh task, so they
/// may block.
#[async_trait]
pub trait ReverbObject: Send + 'static {
    fn base(&self) -> &ObjectBase;
    fn base_mut(&mut self) -> &mut ObjectBase;

    /// Replicated cells in wire order.
    fn fields(&self) -> Vec<&SyncVar>;
    fn fields_mut(&mut self) -> Vec<&mut SyncVar>;

    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    async fn on_init_from_server(&mut self) {}
    async fn on_init_from_client(&mut self) {}
    async fn on_destroy_from_server(&mut self) {}
    async fn on_destroy_from_client(&mut self) {}

    /// Name-to-method table for remote calls. Classes override this with a
    /// match over the methods they expose.
    fn dispatch(&mut self, method: &str, _args: &[Value]) -> Result<(), ReverbError> {
        Err(ReverbError::UnknownMethod {
            type_name: self.base().type_name().to_string(),
            method: method.to_string(),
        })
    }

    /// Serializes this object for one broadcast.
    ///
    /// A full pack emits `[type, owner_tag, field0, field1, ...]` and leaves
    /// change flags alone, so a catch-up for one peer cannot swallow a diff
    /// pending for the others. A diff pack emits the field values from
    /// position 0 through the highest changed position and clears the emitted
    /// flags; with nothing changed it is empty and the object is skipped for
    /// that tick.
    fn pack(&mut self, full: bool) -> Vec<Value> {
        if full {
            let owner = match self.base().owner_tag() {
                Some(port) => Value::from(port),
                None => Value::Null,
            };
            let mut payload = vec![Value::String(self.base().type_name().to_string()), owner];
            payload.extend(self.fields().into_iter().map(|f| f.value().clone()));
            payload
        } else {
            let mut fields = self.fields_mut();
            let Some(last) = fields.iter().rposition(|f| f.has_changed()) else {
                return Vec::new();
            };
            fields
                .drain(..=last)
                .map(|f| {
                    let value = f.value().clone();
                    f.clear_changed();
                    value
                })
                .collect()
        }
    }

    /// Client-only: applies received values to the cells positionally.
    fn sync(&mut self, values: &[Value]) -> Result<(), ReverbError> {
        if let Some(net) = self.base().net() {
            if net.side() == Side::Server {
                return Err(ReverbError::WrongSide {
                    expected: Side::Client,
                    actual: Side::Server,
                });
            }
        }
        for (cell, value) in self.fields_mut().into_iter().zip(values) {
            cell.set_value(value.clone());
        }
        Ok(())
    }
}

/// A class the type registry can construct from the wire.
pub trait ReverbClass: ReverbObject + Sized {
    /// Wire name of the class; the registry key on every peer.
    const TYPE_NAME: &'static str;

    /// Builds an instance from positional field values and the owner tag of
    /// a spawn payload.
    fn construct(values: &[Value], owner_tag: Option<u16>) -> Result<Self, ReverbError>;
}

/// Picks one positional field out of a spawn payload.
pub fn wire_field(values: &[Value], index: usize) -> Result<SyncVar, ReverbError> {
    values
        .get(index)
        .cloned()
        .map(SyncVar::from_value)
        .ok_or_else(|| {
            ReverbError::MalformedPacket(format!("missing replicated field at position {index}"))
        })
}
