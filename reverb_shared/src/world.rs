//! The replication engine.
//!
//! A `ReverbWorld` is the explicit context a process runs one side of the
//! protocol in: the type registry, the live table, the reap delay and the
//! outbound lane. The server's world assigns identities, builds diff batches
//! and despawns; a client's world materializes and updates replicas from
//! received batches. Operations restricted to one side fail with `WrongSide`
//! on the other.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{Packet, REMOVE_RO, SERVER_SYNC};
use crate::errors::ReverbError;
use crate::net::{NetHandle, Peer};
use crate::object::{ReverbClass, ReverbObject};
use crate::registry::{LiveEntry, Lookup, ObjectTable, SharedObject, TypeRegistry};

/// Which half of the wire this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Server => write!(f, "SERVER"),
            Side::Client => write!(f, "CLIENT"),
        }
    }
}

pub struct ReverbWorld {
    side: Side,
    types: TypeRegistry,
    objects: Arc<ObjectTable>,
    reap_delay: Duration,
    net: OnceLock<NetHandle>,
}

impl ReverbWorld {
    pub fn new(side: Side, types: TypeRegistry, reap_delay: Duration) -> Self {
        Self {
            side,
            types,
            objects: Arc::new(ObjectTable::new()),
            reap_delay,
            net: OnceLock::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Wires the outbound lane in. Called once by the endpoint wiring at
    /// startup; anything pushed before that is dropped with a warning.
    pub fn attach_net(&self, net: NetHandle) {
        if self.net.set(net).is_err() {
            warn!("outbound lane already attached; ignoring");
        }
    }

    fn send(&self, packet: Packet) {
        match self.net.get() {
            Some(net) => net.send(packet),
            None => warn!(packet = %packet.name, "no transport attached; dropping packet"),
        }
    }

    fn require_side(&self, expected: Side) -> Result<(), ReverbError> {
        if self.side == expected {
            Ok(())
        } else {
            Err(ReverbError::WrongSide {
                expected,
                actual: self.side,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a replicated object with this world.
    ///
    /// On the server the object must be fresh: it receives a new uid, enters
    /// the live table and `on_init_from_server` runs in its own task. The
    /// first following tick announces it to every client. On a client the
    /// object must already carry the uid the server announced; replicas never
    /// invent identities.
    pub fn add(&self, mut object: Box<dyn ReverbObject>) -> Result<SharedObject, ReverbError> {
        match self.side {
            Side::Server => {
                if object.base().is_uid_set() {
                    return Err(ReverbError::UidAlreadyAssigned {
                        type_name: object.base().type_name().to_string(),
                        uid: object.base().uid().to_string(),
                    });
                }
                let uid = Uuid::new_v4().to_string();
                object.base_mut().set_uid(uid.clone());
                self.register(uid, object)
            }
            Side::Client => {
                if !object.base().is_uid_set() {
                    return Err(ReverbError::UidUnknown);
                }
                object.base_mut().set_initialized();
                let uid = object.base().uid().to_string();
                self.register(uid, object)
            }
        }
    }

    fn register(
        &self,
        uid: String,
        mut object: Box<dyn ReverbObject>,
    ) -> Result<SharedObject, ReverbError> {
        if let Some(net) = self.net.get() {
            object.base_mut().attach_net(net.clone());
        }
        let type_name = object.base().type_name().to_string();
        let shared: SharedObject = Arc::new(tokio::sync::Mutex::new(object));
        self.objects.insert(&uid, &type_name, shared.clone())?;
        debug!(%uid, %type_name, side = %self.side, "replicated object registered");

        let hook = shared.clone();
        let side = self.side;
        tokio::spawn(async move {
            let mut guard = hook.lock().await;
            match side {
                Side::Server => guard.on_init_from_server().await,
                Side::Client => guard.on_init_from_client().await,
            }
        });
        Ok(shared)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Resolves a uid to a live object.
    pub fn get(&self, uid: &str) -> Result<SharedObject, ReverbError> {
        self.objects.get(uid)
    }

    /// All live objects whose wire name is `type_name`.
    pub fn of_type(&self, type_name: &str) -> Vec<SharedObject> {
        self.objects.of_type(type_name)
    }

    /// All live objects of class `T`.
    pub fn of_class<T: ReverbClass>(&self) -> Vec<SharedObject> {
        self.of_type(T::TYPE_NAME)
    }

    pub fn live_count(&self) -> usize {
        self.objects.live_count()
    }

    // -----------------------------------------------------------------------
    // Server side
    // -----------------------------------------------------------------------

    /// One replication tick, driven by the host application's cadence.
    ///
    /// Walks a snapshot of the live table, full-packs anything not yet
    /// announced and diff-packs the rest. Nothing is broadcast when the batch
    /// comes out empty.
    pub async fn server_sync(&self) -> Result<(), ReverbError> {
        self.require_side(Side::Server)?;

        let mut batch = Map::new();
        for (uid, object) in self.objects.snapshot() {
            let mut guard = object.lock().await;
            let full = !guard.base().is_initialized();
            let payload = guard.pack(full);
            if full {
                guard.base_mut().set_initialized();
            }
            if !payload.is_empty() {
                batch.insert(uid, Value::Array(payload));
            }
        }

        if !batch.is_empty() {
            self.send(Packet::new(SERVER_SYNC, vec![Value::Object(batch)]));
        }
        Ok(())
    }

    /// One-shot full-state sync for a freshly connected client, so late
    /// joiners observe the existing world before the next tick's diffs.
    ///
    /// A tick broadcast racing this catch-up can hand the new client the
    /// same object as a full pack twice; replicas detect the repeat and
    /// re-apply it in place (see [`resend_fields`]).
    pub async fn catch_up(&self, peer: &Peer) -> Result<(), ReverbError> {
        self.require_side(Side::Server)?;

        let mut batch = Map::new();
        for (uid, object) in self.objects.snapshot() {
            let mut guard = object.lock().await;
            batch.insert(uid, Value::Array(guard.pack(true)));
        }

        if batch.is_empty() {
            return Ok(());
        }
        info!(client = %peer.addr(), objects = batch.len(), "sending catch-up state");
        peer.send(&Packet::new(SERVER_SYNC, vec![Value::Object(batch)]))
            .await
    }

    /// Despawns a server object: marks it dead, installs a tombstone, runs
    /// `on_destroy_from_server` in its own task, tells every client to drop
    /// the replica and schedules the reaper. Removing an already despawned
    /// uid is a no-op.
    pub async fn remove(&self, uid: &str) -> Result<(), ReverbError> {
        self.require_side(Side::Server)?;

        let object = match self.objects.bury(uid) {
            Lookup::Live(object) => object,
            Lookup::Tombstone => {
                warn!(%uid, "remove called for an already despawned uid");
                return Ok(());
            }
            Lookup::Missing => return Err(ReverbError::ObjectNotFound(uid.to_string())),
        };

        object.lock().await.base_mut().kill();
        let hook = object.clone();
        tokio::spawn(async move {
            hook.lock().await.on_destroy_from_server().await;
        });

        self.send(Packet::new(REMOVE_RO, vec![json!(uid)]));
        info!(%uid, "replicated object despawned");

        let table = self.objects.clone();
        let reap_uid = uid.to_string();
        let delay = self.reap_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            table.reap(&reap_uid);
            debug!(uid = %reap_uid, "tombstone reaped");
        });

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Client side
    // -----------------------------------------------------------------------

    /// Applies one received spawn-or-update batch.
    ///
    /// An unknown uid must open with `[type, owner_tag, ...]` and is
    /// constructed through the type registry. A known uid gets its payload as
    /// positional field updates, unless it is a re-delivered full pack, whose
    /// header is stripped before the fields are applied. A bad entry only
    /// costs itself, the rest of the batch still applies.
    pub async fn apply_server_sync(
        &self,
        batch: &Map<String, Value>,
    ) -> Result<(), ReverbError> {
        self.require_side(Side::Client)?;

        for (uid, payload) in batch {
            let Some(values) = payload.as_array() else {
                warn!(%uid, "sync payload is not an array; skipping entry");
                continue;
            };
            match self.objects.lookup(uid) {
                Lookup::Live(object) => {
                    let mut guard = object.lock().await;
                    let fields = resend_fields(&**guard, values).unwrap_or(values);
                    if let Err(e) = guard.sync(fields) {
                        warn!(%uid, error = %e, "sync failed");
                    }
                }
                _ => {
                    if let Err(e) = self.spawn_replica(uid, values) {
                        warn!(%uid, error = %e, "could not spawn replicated object");
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_replica(&self, uid: &str, values: &[Value]) -> Result<(), ReverbError> {
        let type_name = values.first().and_then(Value::as_str).ok_or_else(|| {
            ReverbError::MalformedPacket("spawn payload must open with a type name".to_string())
        })?;
        let owner_tag = match values.get(1) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or_else(|| {
                        ReverbError::MalformedPacket(
                            "owner tag must be a port number".to_string(),
                        )
                    })?,
            ),
        };

        let mut object =
            self.types
                .construct(type_name, values.get(2..).unwrap_or(&[]), owner_tag)?;
        object.base_mut().set_uid(uid.to_string());
        self.add(object)?;
        info!(%uid, type_name, "replicated object spawned");
        Ok(())
    }

    /// Drops the replica for a despawned uid and runs
    /// `on_destroy_from_client` in its own task. An unknown uid is only worth
    /// a warning; the spawn may never have reached this client.
    pub async fn apply_remove(&self, uid: &str) -> Result<(), ReverbError> {
        self.require_side(Side::Client)?;

        match self.objects.remove(uid) {
            Some(LiveEntry::Object { object, .. }) => {
                object.lock().await.base_mut().kill();
                let hook = object.clone();
                tokio::spawn(async move {
                    hook.lock().await.on_destroy_from_client().await;
                });
                info!(%uid, "replicated object removed");
            }
            _ => warn!(%uid, "remove for a uid this side does not hold"),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remote dispatch, both directions
    // -----------------------------------------------------------------------

    /// Runs a named method on the object a remote peer addressed. A uid that
    /// resolves to a tombstone, or to nothing, names an object despawned
    /// while the call was in flight: the call is dropped, not an error.
    pub async fn dispatch_remote(
        &self,
        uid: &str,
        method: &str,
        args: &[Value],
    ) -> Result<(), ReverbError> {
        match self.objects.lookup(uid) {
            Lookup::Live(object) => object.lock().await.dispatch(method, args),
            Lookup::Tombstone => {
                debug!(%uid, method, "dropping call for a despawned object");
                Ok(())
            }
            Lookup::Missing => {
                warn!(%uid, method, "dropping call for an unknown uid");
                Ok(())
            }
        }
    }
}

/// Detects a full pack delivered for a uid this side already holds, e.g. a
/// catch-up racing the first tick's broadcast, and returns its field values
/// with the `[type, owner_tag]` header stripped.
///
/// The formats cannot collide: a full pack is exactly two entries longer
/// than the object's field list and opens with its type name, while a diff
/// never exceeds the field count.
fn resend_fields<'a>(object: &dyn ReverbObject, values: &'a [Value]) -> Option<&'a [Value]> {
    if values.len() != object.fields().len() + 2 {
        return None;
    }
    if values.first().and_then(Value::as_str) != Some(object.base().type_name()) {
        return None;
    }
    values.get(2..)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::object::{wire_field, ObjectBase, UNKNOWN_UID};
    use crate::sync::SyncVar;

    struct Glint {
        base: ObjectBase,
        pos: SyncVar,
        vel: SyncVar,
    }

    impl Glint {
        fn boxed(owner_tag: Option<u16>) -> Box<dyn ReverbObject> {
            Box::new(Self {
                base: ObjectBase::new(Self::TYPE_NAME, owner_tag),
                pos: SyncVar::new(&json!([0, 0])).unwrap(),
                vel: SyncVar::new(&json!([0, 0])).unwrap(),
            })
        }
    }

    #[async_trait]
    impl ReverbObject for Glint {
        fn base(&self) -> &ObjectBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut ObjectBase {
            &mut self.base
        }
        fn fields(&self) -> Vec<&SyncVar> {
            vec![&self.pos, &self.vel]
        }
        fn fields_mut(&mut self) -> Vec<&mut SyncVar> {
            vec![&mut self.pos, &mut self.vel]
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }

        fn dispatch(&mut self, method: &str, args: &[Value]) -> Result<(), ReverbError> {
            match method {
                "nudge" => {
                    let delta = args.first().and_then(Value::as_i64).unwrap_or(0);
                    self.vel.set(&json!([delta, 0]))
                }
                _ => Err(ReverbError::UnknownMethod {
                    type_name: self.base.type_name().to_string(),
                    method: method.to_string(),
                }),
            }
        }
    }

    impl ReverbClass for Glint {
        const TYPE_NAME: &'static str = "Glint";

        fn construct(values: &[Value], owner_tag: Option<u16>) -> Result<Self, ReverbError> {
            Ok(Self {
                base: ObjectBase::new(Self::TYPE_NAME, owner_tag),
                pos: wire_field(values, 0)?,
                vel: wire_field(values, 1)?,
            })
        }
    }

    fn registered_types() -> TypeRegistry {
        let types = TypeRegistry::new();
        types.register::<Glint>();
        types
    }

    fn server_world() -> (Arc<ReverbWorld>, mpsc::UnboundedReceiver<Packet>) {
        let world = Arc::new(ReverbWorld::new(
            Side::Server,
            registered_types(),
            Duration::from_millis(50),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        world.attach_net(NetHandle::new(Side::Server, 0, tx));
        (world, rx)
    }

    fn client_world() -> Arc<ReverbWorld> {
        Arc::new(ReverbWorld::new(
            Side::Client,
            registered_types(),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn server_add_assigns_a_fresh_uid() {
        let (world, _rx) = server_world();
        let shared = world.add(Glint::boxed(Some(4000))).unwrap();
        let guard = shared.lock().await;
        assert!(guard.base().is_uid_set());
        assert_ne!(guard.base().uid(), UNKNOWN_UID);
        assert_eq!(world.of_class::<Glint>().len(), 1);
    }

    #[tokio::test]
    async fn server_add_refuses_preassigned_uids() {
        let (world, _rx) = server_world();
        let mut object = Glint::boxed(None);
        object.base_mut().set_uid("stale".to_string());
        assert!(matches!(
            world.add(object),
            Err(ReverbError::UidAlreadyAssigned { .. })
        ));
    }

    #[tokio::test]
    async fn client_add_requires_a_uid() {
        let world = client_world();
        assert!(matches!(
            world.add(Glint::boxed(None)),
            Err(ReverbError::UidUnknown)
        ));
    }

    #[tokio::test]
    async fn first_tick_is_full_then_diffs_then_silence() {
        let (world, mut rx) = server_world();
        let shared = world.add(Glint::boxed(Some(4000))).unwrap();
        let uid = shared.lock().await.base().uid().to_string();

        world.server_sync().await.unwrap();
        let packet = rx.try_recv().expect("first tick broadcasts a full pack");
        assert_eq!(packet.name, SERVER_SYNC);
        let batch = packet.contents[0].as_object().unwrap();
        assert_eq!(
            batch[&uid],
            json!(["Glint", 4000, [0, 0], [0, 0]]),
            "full pack is [type, owner, fields...]"
        );

        {
            let mut guard = shared.lock().await;
            let glint = guard.as_any_mut().downcast_mut::<Glint>().unwrap();
            glint.pos.set(&json!([1, 0])).unwrap();
        }
        world.server_sync().await.unwrap();
        let packet = rx.try_recv().expect("changed field broadcasts a diff");
        let batch = packet.contents[0].as_object().unwrap();
        assert_eq!(batch[&uid], json!([[1, 0]]), "diff carries only positions");

        world.server_sync().await.unwrap();
        assert!(rx.try_recv().is_err(), "no changes, no packet");
    }

    #[tokio::test]
    async fn remove_tombstones_broadcasts_and_reaps() {
        let (world, mut rx) = server_world();
        let shared = world.add(Glint::boxed(None)).unwrap();
        let uid = shared.lock().await.base().uid().to_string();
        world.server_sync().await.unwrap();
        let _ = rx.try_recv();

        world.remove(&uid).await.unwrap();
        assert!(!shared.lock().await.base().is_alive());
        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.name, REMOVE_RO);
        assert_eq!(packet.contents, vec![json!(uid)]);

        // Idempotent while tombstoned, and no second broadcast.
        world.remove(&uid).await.unwrap();
        assert!(rx.try_recv().is_err());

        // Calls racing the despawn are swallowed.
        world.dispatch_remote(&uid, "nudge", &[]).await.unwrap();

        // Ticks skip the tombstone entirely.
        world.server_sync().await.unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            world.remove(&uid).await,
            Err(ReverbError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn client_applies_spawns_updates_and_removes() {
        let world = client_world();

        let mut batch = Map::new();
        batch.insert("u-1".to_string(), json!(["Glint", 4000, [7, 7], [0, 0]]));
        world.apply_server_sync(&batch).await.unwrap();

        let shared = world.get("u-1").unwrap();
        {
            let guard = shared.lock().await;
            assert_eq!(guard.base().owner_tag(), Some(4000));
            assert_eq!(guard.fields()[0].value(), &json!([7, 7]));
            assert!(guard.base().is_initialized());
        }

        // Applying the same batch twice leaves the same observable state.
        world.apply_server_sync(&batch).await.unwrap();
        assert_eq!(world.live_count(), 1);
        assert_eq!(
            world.get("u-1").unwrap().lock().await.fields()[0].value(),
            &json!([7, 7])
        );

        // Known uid: payload is positional field updates.
        let mut diff = Map::new();
        diff.insert("u-1".to_string(), json!([[8, 7]]));
        world.apply_server_sync(&diff).await.unwrap();
        assert_eq!(
            world.get("u-1").unwrap().lock().await.fields()[0].value(),
            &json!([8, 7])
        );

        world.apply_remove("u-1").await.unwrap();
        assert!(world.get("u-1").is_err());
        // A second remove is only a warning.
        world.apply_remove("u-1").await.unwrap();
    }

    #[tokio::test]
    async fn re_delivered_full_pack_replaces_instead_of_corrupting() {
        let world = client_world();

        let mut batch = Map::new();
        batch.insert("u-1".to_string(), json!(["Glint", 4000, [7, 7], [0, 0]]));
        world.apply_server_sync(&batch).await.unwrap();

        // A catch-up racing the first tick's broadcast re-delivers the spawn
        // wholesale; the header is stripped and the fields land by position
        // instead of the type name overwriting field 0.
        let mut again = Map::new();
        again.insert("u-1".to_string(), json!(["Glint", 4000, [9, 9], [1, 0]]));
        world.apply_server_sync(&again).await.unwrap();

        let shared = world.get("u-1").unwrap();
        let guard = shared.lock().await;
        assert_eq!(guard.base().owner_tag(), Some(4000));
        assert_eq!(guard.fields()[0].value(), &json!([9, 9]));
        assert_eq!(guard.fields()[1].value(), &json!([1, 0]));
    }

    #[tokio::test]
    async fn unknown_type_aborts_only_its_entry() {
        let world = client_world();

        let mut batch = Map::new();
        batch.insert("u-bad".to_string(), json!(["Ghost", null, 1]));
        batch.insert("u-good".to_string(), json!(["Glint", null, [1, 2], [0, 0]]));
        world.apply_server_sync(&batch).await.unwrap();

        assert!(world.get("u-bad").is_err());
        assert!(world.get("u-good").is_ok());
    }

    #[tokio::test]
    async fn remote_dispatch_reaches_the_method_table() {
        let (world, _rx) = server_world();
        let shared = world.add(Glint::boxed(None)).unwrap();
        let uid = shared.lock().await.base().uid().to_string();

        world
            .dispatch_remote(&uid, "nudge", &[json!(3)])
            .await
            .unwrap();
        assert_eq!(shared.lock().await.fields()[1].value(), &json!([3, 0]));

        assert!(matches!(
            world.dispatch_remote(&uid, "no_such", &[]).await,
            Err(ReverbError::UnknownMethod { .. })
        ));
        // A uid nobody holds is dropped, not an error.
        world.dispatch_remote("gone", "nudge", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn side_restrictions_hold() {
        let world = client_world();
        assert!(matches!(
            world.server_sync().await,
            Err(ReverbError::WrongSide { .. })
        ));
        assert!(matches!(
            world.remove("u").await,
            Err(ReverbError::WrongSide { .. })
        ));

        let (server, _rx) = server_world();
        assert!(matches!(
            server.apply_server_sync(&Map::new()).await,
            Err(ReverbError::WrongSide { .. })
        ));
        assert!(matches!(
            server.apply_remove("u").await,
            Err(ReverbError::WrongSide { .. })
        ));
    }
}
