//! Server wiring.
//!
//! Glues the listening endpoint to a server-side world: binds, installs the
//! framework handlers (catch-up on connection, inbound remote dispatch,
//! disconnect logging) and pumps the world's outbound lane into broadcasts.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use reverb_shared::codec::{
    parse_remote_call, Packet, CALLING_SERVER_COMPUTING, CLIENT_DISCONNECTION,
};
use reverb_shared::config::ReverbConfig;
use reverb_shared::errors::ReverbError;
use reverb_shared::event::{EventRegistry, CLIENT_CONNECTION};
use reverb_shared::net::{NetHandle, ServerEndpoint};
use reverb_shared::object::{ReverbClass, ReverbObject};
use reverb_shared::registry::{SharedObject, TypeRegistry};
use reverb_shared::world::{ReverbWorld, Side};

/// The authoritative endpoint: owns the world, the listener and the event
/// registry applications hang their handlers on.
pub struct ReverbServer {
    world: Arc<ReverbWorld>,
    endpoint: ServerEndpoint,
    events: Arc<EventRegistry>,
}

impl ReverbServer {
    /// Binds the listen address from `cfg` and starts accepting clients.
    /// `types` must hold every replicated class the application uses; clients
    /// are expected to register the same set.
    pub async fn start(cfg: &ReverbConfig, types: TypeRegistry) -> anyhow::Result<Self> {
        let events = Arc::new(EventRegistry::new());
        let world = Arc::new(ReverbWorld::new(Side::Server, types, cfg.reap_delay()));
        register_framework_handlers(&events, &world);

        let endpoint = ServerEndpoint::bind(&cfg.listen_addr, events.clone())
            .await
            .context("bind server endpoint")?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        world.attach_net(NetHandle::new(
            Side::Server,
            endpoint.local_addr().port(),
            tx,
        ));

        // Outbound pump: one consumer keeps broadcast order equal to push
        // order across ticks, despawns and remote calls.
        let pump = endpoint.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = pump.send_to_all(&packet).await {
                    warn!(packet = %packet.name, error = %e, "broadcast failed");
                }
            }
        });

        Ok(Self {
            world,
            endpoint,
            events,
        })
    }

    pub fn world(&self) -> &Arc<ReverbWorld> {
        &self.world
    }

    /// Registry to hang application handlers on, e.g. spawning a player
    /// object on `client_connection`.
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.endpoint.client_count()
    }

    /// Registers a fresh object with the world; it reaches every client on
    /// the next tick.
    pub fn spawn_object(&self, object: Box<dyn ReverbObject>) -> Result<SharedObject, ReverbError> {
        self.world.add(object)
    }

    /// Despawns an object everywhere.
    pub async fn remove_object(&self, uid: &str) -> Result<(), ReverbError> {
        self.world.remove(uid).await
    }

    pub fn object(&self, uid: &str) -> Result<SharedObject, ReverbError> {
        self.world.get(uid)
    }

    pub fn objects_of<T: ReverbClass>(&self) -> Vec<SharedObject> {
        self.world.of_class::<T>()
    }

    /// One replication tick. The host application calls this at its own
    /// cadence; 60 Hz is typical.
    pub async fn sync(&self) -> Result<(), ReverbError> {
        self.world.server_sync().await
    }

    /// Orderly shutdown: every client is told `server_stop`, then sockets
    /// close.
    pub async fn stop(&self) {
        self.endpoint.stop().await;
    }
}

fn register_framework_handlers(events: &Arc<EventRegistry>, world: &Arc<ReverbWorld>) {
    // Late joiners get the current world before the next tick's diffs. Runs
    // inline in the accept task, before the new client's receive task exists.
    let w = world.clone();
    events.on(CLIENT_CONNECTION, move |peer, _contents| {
        let w = w.clone();
        async move {
            if let Err(e) = w.catch_up(&peer).await {
                warn!(client = %peer.addr(), error = %e, "catch-up failed");
            }
        }
    });

    let w = world.clone();
    events.on(CALLING_SERVER_COMPUTING, move |peer, contents| {
        let w = w.clone();
        async move {
            let Some((uid, method, args)) = parse_remote_call(&contents) else {
                warn!(client = %peer.addr(), "malformed remote call packet");
                return;
            };
            if let Err(e) = w.dispatch_remote(uid, method, args).await {
                error!(client = %peer.addr(), %uid, method, error = %e, "remote call failed");
            }
        }
    });

    events.on(CLIENT_DISCONNECTION, |peer, _contents| async move {
        info!(client = %peer.addr(), "client left");
    });
}

/// Helper for tests and demos: bind to an ephemeral local port.
pub async fn start_ephemeral(types: TypeRegistry) -> anyhow::Result<(ReverbServer, ReverbConfig)> {
    let mut cfg = ReverbConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..ReverbConfig::default()
    };
    let server = ReverbServer::start(&cfg, types).await?;
    let addr = server.local_addr();
    cfg.listen_addr = addr.to_string();
    cfg.connect_addr = addr.to_string();
    Ok((server, cfg))
}
