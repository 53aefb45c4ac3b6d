//! Demonstration application.
//!
//! One binary plays either role, picked by the first argument:
//!
//!   cargo run -p reverb_demo -- SERVER [--addr 0.0.0.0:8080] [--tick-hz 60]
//!   cargo run -p reverb_demo -- CLIENT [--addr 127.0.0.1:8080]
//!
//! The server spawns one pawn per connecting client, tagged with that
//! client's port, and integrates velocities at the tick rate. Clients watch
//! the replicated pawns and steer their own through `compute_server`.

mod pawn;

use std::env;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use pawn::Pawn;
use reverb_client::ReverbClient;
use reverb_server::ReverbServer;
use reverb_shared::codec::CLIENT_DISCONNECTION;
use reverb_shared::config::ReverbConfig;
use reverb_shared::event::CLIENT_CONNECTION;
use reverb_shared::registry::TypeRegistry;

const COLORS: [&str; 4] = ["red", "green", "blue", "yellow"];

fn parse_args() -> (String, ReverbConfig) {
    let mut cfg = ReverbConfig::default();
    let args: Vec<String> = env::args().collect();
    let side = args.get(1).cloned().unwrap_or_else(|| "SERVER".to_string());
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                cfg.connect_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            _ => i += 1,
        }
    }
    (side, cfg)
}

fn demo_types() -> TypeRegistry {
    let types = TypeRegistry::new();
    types.register::<Pawn>();
    types
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (side, cfg) = parse_args();
    match side.as_str() {
        "SERVER" => run_server(cfg).await,
        "CLIENT" => run_client(cfg).await,
        other => anyhow::bail!("unknown side '{other}', expected SERVER or CLIENT"),
    }
}

async fn run_server(cfg: ReverbConfig) -> anyhow::Result<()> {
    let server = ReverbServer::start(&cfg, demo_types()).await?;
    info!(addr = %server.local_addr(), tick_hz = cfg.tick_hz, "demo server up");

    // Every connecting client gets a pawn tagged with its port.
    let world = server.world().clone();
    server.events().on(CLIENT_CONNECTION, move |peer, _contents| {
        let world = world.clone();
        async move {
            let port = peer.addr().port();
            let x = f64::from(port % 640);
            let y = f64::from(port % 480);
            match Pawn::new(x, y, COLORS[usize::from(port) % COLORS.len()], Some(port)) {
                Ok(pawn) => {
                    if let Err(e) = world.add(Box::new(pawn)) {
                        warn!(client = %peer.addr(), error = %e, "could not spawn a pawn");
                    }
                }
                Err(e) => warn!(error = %e, "pawn construction failed"),
            }
        }
    });

    // And loses it again when it leaves.
    let world = server.world().clone();
    server
        .events()
        .on(CLIENT_DISCONNECTION, move |peer, _contents| {
            let world = world.clone();
            async move {
                let port = peer.addr().port();
                for shared in world.of_class::<Pawn>() {
                    let uid = {
                        let guard = shared.lock().await;
                        (guard.base().owner_tag() == Some(port))
                            .then(|| guard.base().uid().to_string())
                    };
                    if let Some(uid) = uid {
                        if let Err(e) = world.remove(&uid).await {
                            warn!(%uid, error = %e, "could not despawn the pawn");
                        }
                    }
                }
            }
        });

    let tick = cfg.tick_interval();
    let mut next = tokio::time::Instant::now();
    loop {
        for shared in server.world().of_class::<Pawn>() {
            let mut guard = shared.lock().await;
            if let Some(pawn) = guard.as_any_mut().downcast_mut::<Pawn>() {
                if let Err(e) = pawn.step() {
                    warn!(error = %e, "pawn step failed");
                }
            }
        }
        server.sync().await?;

        next += tick;
        tokio::time::sleep_until(next).await;
    }
}

async fn run_client(cfg: ReverbConfig) -> anyhow::Result<()> {
    let client = ReverbClient::connect(&cfg, demo_types()).await?;
    info!(server = %client.server_addr(), port = client.local_port(), "demo client up");

    const WALK_CYCLE: [&str; 4] = ["N", "E", "S", "W"];
    let mut beat = 0usize;
    while client.is_connected() {
        tokio::time::sleep(Duration::from_millis(500)).await;

        for shared in client.objects_of::<Pawn>() {
            let guard = shared.lock().await;
            let Some(view) = guard.as_any().downcast_ref::<Pawn>() else {
                continue;
            };
            let (x, y) = view.position();
            let mine = guard.base().is_owner().unwrap_or(false);
            info!(uid = %guard.base().uid(), x, y, mine, "pawn");

            if mine {
                let dir = WALK_CYCLE[beat % WALK_CYCLE.len()];
                if let Err(e) = guard.base().compute_server("walk", vec![json!(dir)]) {
                    warn!(error = %e, "walk request failed");
                }
            }
        }
        beat += 1;
    }

    client.disconnect().await;
    info!("bye");
    Ok(())
}
