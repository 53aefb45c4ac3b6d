//! `reverb_shared`
//!
//! Libraries used by both sides of the replication wire.
//!
//! Design goals:
//! - One authoritative server, any number of replica clients.
//! - Explicit type registry and ordered field lists; no reflection.
//! - Task-per-socket and task-per-handler concurrency on tokio.
//! - No `unsafe`.

pub mod codec;
pub mod config;
pub mod errors;
pub mod event;
pub mod net;
pub mod object;
pub mod registry;
pub mod sync;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::{Packet, to_value};
    pub use crate::config::ReverbConfig;
    pub use crate::errors::ReverbError;
    pub use crate::event::EventRegistry;
    pub use crate::net::Peer;
    pub use crate::object::{wire_field, ObjectBase, ReverbClass, ReverbObject};
    pub use crate::registry::{SharedObject, TypeRegistry};
    pub use crate::sync::SyncVar;
    pub use crate::world::{ReverbWorld, Side};
}
