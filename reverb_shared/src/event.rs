//! Name-indexed handler registry.
//!
//! One instance exists per side. Receive loops decode a packet and hand its
//! contents here; each handler normally runs in its own task so one slow
//! handler cannot stall the socket. Handlers registered with `on_inline` (and
//! any dispatch triggered with `inline = true`) are awaited in place, for the
//! few events whose completion the caller must observe.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::warn;

use crate::net::Peer;

/// Fired on the server when a new client has been accepted.
pub const CLIENT_CONNECTION: &str = "client_connection";
/// Fired on the client once the connection to the server is up.
pub const CONNECTION: &str = "connection";
/// Fired on the client when the connection goes away.
pub const DISCONNECTION: &str = "disconnection";

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(Peer, Vec<Value>) -> HandlerFuture + Send + Sync>;

struct Registration {
    handler: Handler,
    inline: bool,
}

/// Name to handler-list table with per-handler task isolation.
#[derive(Default)]
pub struct EventRegistry {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler dispatched in its own task.
    pub fn on<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Peer, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(name, handler, false);
    }

    /// Registers a handler the dispatching task awaits in place. Used where
    /// per-connection ordering matters, e.g. applying replication batches.
    pub fn on_inline<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Peer, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(name, handler, true);
    }

    fn register<F, Fut>(&self, name: &str, handler: F, inline: bool)
    where
        F: Fn(Peer, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |peer, contents| Box::pin(handler(peer, contents)));
        self.handlers
            .write()
            .expect("event table poisoned")
            .entry(name.to_string())
            .or_default()
            .push(Registration { handler, inline });
    }

    /// Dispatches `contents` to every handler registered under `name`.
    /// `inline = true` forces all of them to run in the caller's task.
    /// Unknown names are only worth a warning; a peer may emit events this
    /// side never subscribed to.
    pub async fn trigger(&self, name: &str, peer: Peer, contents: Vec<Value>, inline: bool) {
        let registrations: Vec<(Handler, bool)> = {
            let handlers = self.handlers.read().expect("event table poisoned");
            match handlers.get(name) {
                Some(list) => list.iter().map(|r| (r.handler.clone(), r.inline)).collect(),
                None => {
                    warn!(event = name, "no handler registered; ignoring");
                    return;
                }
            }
        };

        for (handler, handler_inline) in registrations {
            let fut = handler(peer.clone(), contents.clone());
            if inline || handler_inline {
                fut.await;
            } else {
                tokio::spawn(fut);
            }
        }
    }

    pub fn event_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("event table poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::net::Peer;

    async fn loopback_peer() -> Peer {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_reader, writer) = client.into_split();
        Peer::new(addr, writer)
    }

    #[tokio::test]
    async fn inline_handlers_complete_before_trigger_returns() {
        let registry = EventRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        registry.on_inline("ping", move |_peer, contents| {
            let counter = counter.clone();
            async move {
                assert_eq!(contents, vec![json!(7)]);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let peer = loopback_peer().await;
        registry.trigger("ping", peer, vec![json!(7)], false).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_handler_for_a_name_runs() {
        let registry = EventRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = hits.clone();
            registry.on_inline("ping", move |_peer, _contents| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let peer = loopback_peer().await;
        registry.trigger("ping", peer, Vec::new(), true).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_event_is_not_an_error() {
        let registry = EventRegistry::new();
        let peer = loopback_peer().await;
        registry.trigger("nobody_home", peer, Vec::new(), false).await;
    }
}
