//! Full socket-based integration tests: a real server and a real client
//! exchanging spawns, diffs, remote calls and shutdown.

use std::time::Duration;

use serde_json::json;

use reverb_client::ReverbClient;
use reverb_server::{start_ephemeral, ReverbServer};
use reverb_shared::config::ReverbConfig;
use reverb_shared::registry::SharedObject;
use reverb_tests::{puppet_types, wait_for_clients, Puppet};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

async fn wait_for_replicas(client: &ReverbClient, n: usize) -> Vec<SharedObject> {
    for _ in 0..200 {
        let replicas = client.objects_of::<Puppet>();
        if replicas.len() >= n {
            return replicas;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {n} replicas, saw {}",
        client.objects_of::<Puppet>().len()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_object_is_reconstructed_on_the_client() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = start_ephemeral(puppet_types()).await?;
    let client = ReverbClient::connect(&cfg, puppet_types()).await?;
    wait_for_clients(&server, 1).await;

    let shared = server.spawn_object(Box::new(Puppet::new(
        400,
        400,
        "red",
        Some(client.local_port()),
    )?))?;
    let uid = shared.lock().await.base().uid().to_string();
    server.sync().await?;

    let replicas = wait_for_replicas(&client, 1).await;
    let guard = replicas[0].lock().await;
    assert_eq!(guard.base().uid(), uid);
    assert_eq!(guard.base().type_name(), "Puppet");
    assert_eq!(guard.base().owner_tag(), Some(client.local_port()));
    assert_eq!(guard.fields()[0].value(), &json!([400, 400]));
    assert_eq!(guard.fields()[1].value(), &json!([0, 0]));
    assert_eq!(guard.fields()[2].value(), &json!("red"));
    assert!(guard.base().is_owner()?, "owner tag matches the local port");

    client.disconnect().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compute_server_runs_the_method_and_the_change_flows_back() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = start_ephemeral(puppet_types()).await?;
    let client = ReverbClient::connect(&cfg, puppet_types()).await?;
    wait_for_clients(&server, 1).await;

    let authoritative = server.spawn_object(Box::new(Puppet::new(
        0,
        0,
        "red",
        Some(client.local_port()),
    )?))?;
    server.sync().await?;
    let replicas = wait_for_replicas(&client, 1).await;

    // The owning client asks the server to walk east.
    replicas[0]
        .lock()
        .await
        .base()
        .compute_server("check_walk", vec![json!("E")])?;

    // The method mutates the authoritative velocity...
    for _ in 0..200 {
        if authoritative.lock().await.fields()[1].value() == &json!([1, 0]) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(authoritative.lock().await.fields()[1].value(), &json!([1, 0]));

    // ...and the next diff carries it back down.
    let mut arrived = false;
    for _ in 0..200 {
        server.sync().await?;
        if replicas[0].lock().await.fields()[1].value() == &json!([1, 0]) {
            arrived = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(arrived, "diff never reached the replica");

    client.disconnect().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compute_client_reaches_every_replica() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = start_ephemeral(puppet_types()).await?;
    let client = ReverbClient::connect(&cfg, puppet_types()).await?;
    wait_for_clients(&server, 1).await;

    let authoritative = server.spawn_object(Box::new(Puppet::new(0, 0, "red", None)?))?;
    server.sync().await?;
    let replicas = wait_for_replicas(&client, 1).await;

    authoritative
        .lock()
        .await
        .base()
        .compute_client("flash", vec![])?;

    for _ in 0..200 {
        let guard = replicas[0].lock().await;
        if guard.as_any().downcast_ref::<Puppet>().unwrap().flashes == 1 {
            client.disconnect().await;
            return Ok(());
        }
        drop(guard);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("flash never ran on the replica");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn despawn_removes_the_replica_and_late_calls_are_dropped() -> anyhow::Result<()> {
    init_tracing();
    let cfg = ReverbConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        reap_delay_ms: 100,
        ..ReverbConfig::default()
    };
    let server = ReverbServer::start(&cfg, puppet_types()).await?;
    let cfg = ReverbConfig {
        connect_addr: server.local_addr().to_string(),
        ..cfg
    };
    let client = ReverbClient::connect(&cfg, puppet_types()).await?;
    wait_for_clients(&server, 1).await;

    let shared = server.spawn_object(Box::new(Puppet::new(
        0,
        0,
        "red",
        Some(client.local_port()),
    )?))?;
    let uid = shared.lock().await.base().uid().to_string();
    server.sync().await?;
    let replicas = wait_for_replicas(&client, 1).await;

    server.remove_object(&uid).await?;
    for _ in 0..200 {
        if client.objects_of::<Puppet>().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(client.objects_of::<Puppet>().is_empty());
    assert!(client.object(&uid).is_err());

    // The stale replica handle goes dead, and its outgoing calls are dropped
    // rather than sent.
    let mut dead = false;
    for _ in 0..200 {
        if !replicas[0].lock().await.base().is_alive() {
            dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(dead, "replica was never marked dead");
    replicas[0]
        .lock()
        .await
        .base()
        .compute_server("check_walk", vec![json!("E")])?;

    // Past the reap delay the uid is physically gone on the server too, and
    // dispatching to it is still not an error.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.object(&uid).is_err());
    server
        .world()
        .dispatch_remote(&uid, "check_walk", &[json!("E")])
        .await?;

    client.disconnect().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_client_leave_is_observed_by_the_server() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = start_ephemeral(puppet_types()).await?;
    let client = ReverbClient::connect(&cfg, puppet_types()).await?;
    wait_for_clients(&server, 1).await;

    client.disconnect().await;
    for _ in 0..200 {
        if server.client_count() == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never noticed the leave");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_stop_disconnects_clients() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = start_ephemeral(puppet_types()).await?;
    let client = ReverbClient::connect(&cfg, puppet_types()).await?;
    wait_for_clients(&server, 1).await;
    assert!(client.is_connected());

    server.stop().await;
    for _ in 0..200 {
        if !client.is_connected() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client never saw the stop");
}
