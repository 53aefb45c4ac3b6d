//! Error taxonomy shared by both sides of the wire.

use crate::world::Side;

/// Everything that can go wrong inside the replication framework.
///
/// Network-loop tasks never abort the process on these: they log and keep
/// reading. Operations invoked directly by application code (spawning,
/// removing, lookups, the tick) surface them to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ReverbError {
    /// An operation restricted to one side was invoked on the other.
    #[error("operation restricted to the {expected} side was called on the {actual} side")]
    WrongSide { expected: Side, actual: Side },

    /// A server-side add was given an object that already carries a uid.
    #[error("'{type_name}' already carries uid {uid}; only fresh objects can be registered")]
    UidAlreadyAssigned { type_name: String, uid: String },

    /// A client-side add was given an object without a uid. Replicas only
    /// instantiate objects the server has announced.
    #[error("object has no uid; a replica never invents one")]
    UidUnknown,

    /// The live table already holds an entry for this uid.
    #[error("an object with uid {0} is already registered")]
    DuplicateObject(String),

    /// The uid is absent from the live table (or despawned).
    #[error("no live object for uid {0}")]
    ObjectNotFound(String),

    /// A type name received from the wire has no registered constructor.
    #[error("type '{0}' is not present in the type registry")]
    TypeNotFound(String),

    /// A remote call named a method the target object does not expose.
    #[error("'{type_name}' does not expose a remote method named '{method}'")]
    UnknownMethod { type_name: String, method: String },

    /// Undecodable frame body: broken JSON or missing/mistyped fields.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// An outbound value cannot be encoded as JSON. Raised before anything
    /// is written so a broadcast is never partially sent.
    #[error("value cannot be encoded as JSON: {0}")]
    NotSerializable(String),

    /// Socket-level failure (includes broken pipes during writes).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
