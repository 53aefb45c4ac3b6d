//! Shared fixtures for the integration suite: a small replicated class and a
//! raw-socket probe for asserting exact wire bodies.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use reverb_shared::codec::Packet;
use reverb_shared::errors::ReverbError;
use reverb_shared::object::{wire_field, ObjectBase, ReverbClass, ReverbObject};
use reverb_shared::registry::TypeRegistry;
use reverb_shared::sync::SyncVar;

/// Test class: a position, a velocity and a color, plus two remote methods.
pub struct Puppet {
    base: ObjectBase,
    pub pos: SyncVar,
    pub vel: SyncVar,
    pub color: SyncVar,
    /// Not replicated; counts `flash` calls dispatched on this side.
    pub flashes: u32,
}

impl Puppet {
    pub fn new(x: i64, y: i64, color: &str, owner_tag: Option<u16>) -> Result<Self, ReverbError> {
        Ok(Self {
            base: ObjectBase::new(Self::TYPE_NAME, owner_tag),
            pos: SyncVar::new(&json!([x, y]))?,
            vel: SyncVar::new(&json!([0, 0]))?,
            color: SyncVar::new(&color)?,
            flashes: 0,
        })
    }
}

#[async_trait]
impl ReverbObject for Puppet {
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

    fn dispatch(&mut self, method: &str, args: &[Value]) -> Result<(), ReverbError> {
        match method {
            "check_walk" => {
                let vel = match args.first().and_then(Value::as_str) {
                    Some("N") => [0, -1],
                    Some("S") => [0, 1],
                    Some("W") => [-1, 0],
                    Some("E") => [1, 0],
                    _ => [0, 0],
                };
                self.vel.set(&json!(vel))
            }
            "flash" => {
                self.flashes += 1;
                Ok(())
            }
            _ => Err(ReverbError::UnknownMethod {
                type_name: self.base.type_name().to_string(),
                method: method.to_string(),
            }),
        }
    }
}

impl ReverbClass for Puppet {
    const TYPE_NAME: &'static str = "Puppet";

    fn construct(values: &[Value], owner_tag: Option<u16>) -> Result<Self, ReverbError> {
        Ok(Self {
            base: ObjectBase::new(Self::TYPE_NAME, owner_tag),
            pos: wire_field(values, 0)?,
            vel: wire_field(values, 1)?,
            color: wire_field(values, 2)?,
            flashes: 0,
        })
    }
}

/// A registry holding the one test class.
pub fn puppet_types() -> TypeRegistry {
    let types = TypeRegistry::new();
    types.register::<Puppet>();
    types
}

/// A bare TCP participant speaking the frame protocol by hand, for asserting
/// exactly what crosses the wire.
pub struct WireProbe {
    stream: TcpStream,
    local_port: u16,
}

impl WireProbe {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("probe connect")?;
        let local_port = stream.local_addr().context("probe local_addr")?.port();
        Ok(Self { stream, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Reads one packet, or `None` if the wire stays silent for `wait`.
    pub async fn recv(&mut self, wait: Duration) -> anyhow::Result<Option<Packet>> {
        let frame = async {
            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        };
        match tokio::time::timeout(wait, frame).await {
            Ok(body) => {
                let packet = Packet::decode(&body.context("probe read")?)?;
                Ok(Some(packet))
            }
            Err(_) => Ok(None),
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let frame = packet.encode_frame()?;
        self.stream.write_all(&frame).await.context("probe write")?;
        Ok(())
    }

    /// Writes an arbitrary body under a correct length header, for feeding
    /// the receiver things the codec would never produce.
    pub async fn send_raw(&mut self, body: &[u8]) -> anyhow::Result<()> {
        self.stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await?;
        self.stream.write_all(body).await?;
        Ok(())
    }
}

/// Polls until the server has accepted `n` clients.
pub async fn wait_for_clients(server: &reverb_server::ReverbServer, n: usize) {
    for _ in 0..200 {
        if server.client_count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} connected clients, saw {}", server.client_count());
}
