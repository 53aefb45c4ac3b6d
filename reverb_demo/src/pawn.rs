//! The demo's replicated class: a pawn with a position, a velocity and a
//! color. Clients steer their own pawn by asking the server to `walk`.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use reverb_shared::errors::ReverbError;
use reverb_shared::object::{wire_field, ObjectBase, ReverbClass, ReverbObject};
use reverb_shared::sync::SyncVar;

pub struct Pawn {
    base: ObjectBase,
    pos: SyncVar,
    vel: SyncVar,
    color: SyncVar,
}

impl Pawn {
    pub const SPEED: f64 = 4.0;

    pub fn new(x: f64, y: f64, color: &str, owner_tag: Option<u16>) -> Result<Self, ReverbError> {
        Ok(Self {
            base: ObjectBase::new(Self::TYPE_NAME, owner_tag),
            pos: SyncVar::new(&json!([x, y]))?,
            vel: SyncVar::new(&json!([0.0, 0.0]))?,
            color: SyncVar::new(&color)?,
        })
    }

    pub fn position(&self) -> (f64, f64) {
        let [x, y]: [f64; 2] = self.pos.get_as().unwrap_or([0.0, 0.0]);
        (x, y)
    }

    /// Integrates velocity into position for one tick. Server-side only; the
    /// result reaches replicas through the next sync.
    pub fn step(&mut self) -> Result<(), ReverbError> {
        let [x, y]: [f64; 2] = self.pos.get_as().unwrap_or([0.0, 0.0]);
        let [vx, vy]: [f64; 2] = self.vel.get_as().unwrap_or([0.0, 0.0]);
        if vx != 0.0 || vy != 0.0 {
            self.pos.set(&json!([x + vx, y + vy]))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReverbObject for Pawn {
    fn base(&self) -> &ObjectBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }
    fn fields(&self) -> Vec<&SyncVar> {
        vec![&self.pos, &self.vel, &self.color]
    }
    fn fields_mut(&mut self) -> Vec<&mut SyncVar> {
        vec![&mut self.pos, &mut self.vel, &mut self.color]
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    async fn on_init_from_server(&mut self) {
        info!(uid = %self.base.uid(), owner = ?self.base.owner_tag(), "pawn spawned");
    }

    async fn on_init_from_client(&mut self) {
        info!(uid = %self.base.uid(), owner = ?self.base.owner_tag(), "pawn appeared");
    }

    async fn on_destroy_from_client(&mut self) {
        info!(uid = %self.base.uid(), "pawn left");
    }

    fn dispatch(&mut self, method: &str, args: &[Value]) -> Result<(), ReverbError> {
        match method {
            "walk" => {
                let vel = match args.first().and_then(Value::as_str) {
                    Some("N") => [0.0, -Self::SPEED],
                    Some("S") => [0.0, Self::SPEED],
                    Some("W") => [-Self::SPEED, 0.0],
                    Some("E") => [Self::SPEED, 0.0],
                    _ => [0.0, 0.0],
                };
                self.vel.set(&json!(vel))
            }
            "stop" => self.vel.set(&json!([0.0, 0.0])),
            _ => Err(ReverbError::UnknownMethod {
                type_name: self.base.type_name().to_string(),
                method: method.to_string(),
            }),
        }
    }
}

impl ReverbClass for Pawn {
    const TYPE_NAME: &'static str = "Pawn";

    fn construct(values: &[Value], owner_tag: Option<u16>) -> Result<Self, ReverbError> {
        Ok(Self {
            base: ObjectBase::new(Self::TYPE_NAME, owner_tag),
            pos: wire_field(values, 0)?,
            vel: wire_field(values, 1)?,
            color: wire_field(values, 2)?,
        })
    }
}
