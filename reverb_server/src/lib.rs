//! `reverb_server`
//!
//! Authoritative side of the replication wire. The host application starts a
//! [`server::ReverbServer`], spawns replicated objects into its world and
//! drives [`server::ReverbServer::sync`] at whatever cadence it likes.

pub mod server;

pub use server::{start_ephemeral, ReverbServer};
