#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use uod::config::ServerConfig;
use uod::core::Server;
use uod::game::Location;
use uod::network::{self, huffman, Framer};
use uod::protocol::{ClientPacket, ServerPacket};
use uod::world::WorldHandle;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(save_dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        login_ip: "127.0.0.1".into(),
        login_port: 0,
        game_bind_ip: "127.0.0.1".into(),
        game_port: 0,
        map_width: 512,
        map_height: 512,
        start_location: Location::new(100, 100, 0),
        save_interval_secs: 0,
        logout_grace_secs: 1,
        action_delay_ms: 0,
        save_dir: save_dir.to_string_lossy().into_owned(),
        ..ServerConfig::default()
    }
}

pub fn temp_dir(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "uod_{}_{}_{}",
        tag,
        std::process::id(),
        rand::random::<u32>()
    ))
}

pub struct Running {
    pub login: SocketAddr,
    pub game: SocketAddr,
    pub world: WorldHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    pub async fn start(config: ServerConfig) -> Running {
        let server = Server::bind(config).await.unwrap();
        let (login, game, world) = (server.login_addr(), server.game_addr(), server.world());
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));
        Running { login, game, world, stop, task }
    }

    /// Signals shutdown and waits for the final save.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// A scripted client speaking the wire protocol.
pub struct Client {
    stream: TcpStream,
    framer: Framer,
    compressed: bool,
    raw: Vec<u8>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x7F, 0x00, 0x00, 0x01]).await.unwrap();
        Client {
            stream,
            framer: Framer::new(),
            compressed: false,
            raw: Vec::new(),
        }
    }

    /// Replies arrive Huffman-compressed from here on.
    pub fn expect_compression(&mut self) {
        self.compressed = true;
    }

    pub async fn send(&mut self, packet: ClientPacket) {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }

    pub async fn recv(&mut self) -> ServerPacket {
        tokio::time::timeout(READ_TIMEOUT, self.next())
            .await
            .expect("timed out waiting for a packet")
    }

    /// Reads until a packet with `id` arrives, returning everything seen.
    pub async fn recv_until(&mut self, id: u8) -> Vec<ServerPacket> {
        let mut seen = Vec::new();
        loop {
            let packet = self.recv().await;
            let done = packet.id() == id;
            seen.push(packet);
            if done {
                return seen;
            }
        }
    }

    /// True once the server has closed the connection.
    pub async fn closed(&mut self) -> bool {
        let mut byte = [0u8; 64];
        loop {
            match tokio::time::timeout(READ_TIMEOUT, self.stream.read(&mut byte)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn next(&mut self) -> ServerPacket {
        if !self.compressed {
            let raw = network::read_packet(&mut self.stream, &mut self.framer)
                .await
                .unwrap()
                .expect("connection closed");
            return ServerPacket::decode(&raw).unwrap();
        }
        loop {
            let mut out = Vec::new();
            if let Ok(used) = huffman::decompress(&self.raw, &mut out) {
                self.raw.drain(..used);
                return ServerPacket::decode(&out).unwrap();
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed");
            self.raw.extend_from_slice(&chunk[..n]);
        }
    }
}

pub fn account_login(username: &str, password: &str) -> ClientPacket {
    ClientPacket::AccountLogin {
        username: username.into(),
        password: password.into(),
        key: 0,
    }
}

pub fn game_login(key: u32, username: &str, password: &str) -> ClientPacket {
    ClientPacket::GameLogin {
        key,
        username: username.into(),
        password: password.into(),
    }
}

pub fn play(username: &str) -> ClientPacket {
    ClientPacket::PlayCharacter {
        name: username.into(),
        slot: 0,
        client_ip: 0x7F00_0001,
    }
}

/// Game login plus character selection; returns the player serial.
pub async fn enter_world(game: SocketAddr, username: &str, password: &str) -> (Client, uod::game::Serial) {
    let mut client = Client::connect(game).await;
    client.send(game_login(1, username, password)).await;
    client.expect_compression();
    let list = client.recv_until(0xA9).await;
    assert!(list.contains(&ServerPacket::Features { flags: 0x8003 }));
    client.send(play(username)).await;
    let entered = client.recv_until(0x55).await;
    let serial = match entered.first() {
        Some(ServerPacket::LoginConfirm { serial, .. }) => *serial,
        other => panic!("expected LoginConfirm, got {:?}", other),
    };
    (client, serial)
}
