//! Client wiring.
//!
//! Glues the connecting endpoint to a client-side world. The replication
//! handlers (`server_sync`, `remove_ro`, `calling_client_computing`) are
//! registered inline so one receive task applies them in the order the server
//! sent them; an init hook has therefore always been launched before the
//! first field update for its object is processed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use reverb_shared::codec::{parse_remote_call, Packet, CALLING_CLIENT_COMPUTING, REMOVE_RO, SERVER_SYNC};
use reverb_shared::config::ReverbConfig;
use reverb_shared::errors::ReverbError;
use reverb_shared::event::{EventRegistry, CONNECTION, DISCONNECTION};
use reverb_shared::net::{ClientEndpoint, NetHandle};
use reverb_shared::object::ReverbClass;
use reverb_shared::registry::{SharedObject, TypeRegistry};
use reverb_shared::world::{ReverbWorld, Side};

/// A connected replica: owns the client-side world and the socket to the
/// server.
pub struct ReverbClient {
    world: Arc<ReverbWorld>,
    endpoint: Arc<ClientEndpoint>,
    events: Arc<EventRegistry>,
}

impl ReverbClient {
    /// Connects to the address in `cfg`. `types` must mirror the server's
    /// registrations or incoming spawns will be refused entry.
    pub async fn connect(cfg: &ReverbConfig, types: TypeRegistry) -> anyhow::Result<Self> {
        let events = Arc::new(EventRegistry::new());
        let world = Arc::new(ReverbWorld::new(Side::Client, types, cfg.reap_delay()));
        register_framework_handlers(&events, &world);

        let endpoint = Arc::new(
            ClientEndpoint::connect(&cfg.connect_addr, events.clone())
                .await
                .context("connect to server")?,
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        world.attach_net(NetHandle::new(Side::Client, endpoint.local_port(), tx));

        let pump = endpoint.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = pump.send(&packet).await {
                    warn!(packet = %packet.name, error = %e, "send to server failed");
                }
            }
        });

        // Only start reading once the world can hand out its outbound lane;
        // an instant catch-up must not spawn detached replicas.
        endpoint.start();

        Ok(Self {
            world,
            endpoint,
            events,
        })
    }

    pub fn world(&self) -> &Arc<ReverbWorld> {
        &self.world
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.endpoint.server_addr()
    }

    /// The ephemeral port this client connected from; objects whose owner tag
    /// equals it answer `is_owner` with true here.
    pub fn local_port(&self) -> u16 {
        self.endpoint.local_port()
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }

    pub fn object(&self, uid: &str) -> Result<SharedObject, ReverbError> {
        self.world.get(uid)
    }

    pub fn objects_of<T: ReverbClass>(&self) -> Vec<SharedObject> {
        self.world.of_class::<T>()
    }

    /// Leaves gracefully: best-effort notice to the server, then teardown.
    pub async fn disconnect(&self) {
        self.endpoint.disconnect().await;
    }
}

fn register_framework_handlers(events: &Arc<EventRegistry>, world: &Arc<ReverbWorld>) {
    let w = world.clone();
    events.on_inline(SERVER_SYNC, move |_peer, contents| {
        let w = w.clone();
        async move {
            let Some(batch) = contents.first().and_then(Value::as_object) else {
                warn!("server_sync contents are not an object; ignoring");
                return;
            };
            if let Err(e) = w.apply_server_sync(batch).await {
                warn!(error = %e, "could not apply server sync");
            }
        }
    });

    let w = world.clone();
    events.on_inline(REMOVE_RO, move |_peer, contents| {
        let w = w.clone();
        async move {
            let Some(uid) = contents.first().and_then(Value::as_str) else {
                warn!("remove_ro contents are not a uid; ignoring");
                return;
            };
            if let Err(e) = w.apply_remove(uid).await {
                warn!(uid, error = %e, "could not apply remove");
            }
        }
    });

    let w = world.clone();
    events.on_inline(CALLING_CLIENT_COMPUTING, move |_peer, contents| {
        let w = w.clone();
        async move {
            let Some((uid, method, args)) = parse_remote_call(&contents) else {
                warn!("malformed remote call packet");
                return;
            };
            if let Err(e) = w.dispatch_remote(uid, method, args).await {
                error!(%uid, method, error = %e, "remote call failed");
            }
        }
    });

    events.on(CONNECTION, |peer, _contents| async move {
        info!(server = %peer.addr(), "connection established");
    });
    events.on(DISCONNECTION, |_peer, _contents| async move {
        info!("connection closed");
    });
}
