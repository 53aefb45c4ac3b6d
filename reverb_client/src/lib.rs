//! `reverb_client`
//!
//! Replica side of the replication wire. A [`client::ReverbClient`] connects,
//! mirrors whatever the server announces and routes `compute_server` requests
//! back up.

pub mod client;

pub use client::ReverbClient;
