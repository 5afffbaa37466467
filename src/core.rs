//! Logical clock and the `Server` aggregate
//!
//! This module provides:
//! - The shared logical clock (advanced only by the world actor)
//! - `Server`: listeners, world actor, session registry and their lifecycle
//! - Accept loops with blacklist and connect-throttle checks
//! - Shutdown signal handling

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::game::{Tick, TemplateManager};
use crate::network::acl::Blacklist;
use crate::network::throttle::ConnectThrottle;
use crate::save::SaveManager;
use crate::session::{self, Service, SessionContext, SessionLimits, SessionRegistry};
use crate::world::{self, World, WorldHandle};

/// World time in ticks, readable from any task.
#[derive(Debug, Clone, Default)]
pub struct Clock(Arc<AtomicU64>);

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Tick {
        self.0.load(Ordering::Acquire)
    }

    /// Advances by one tick and returns the new time.
    pub fn advance(&self) -> Tick {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set(&self, now: Tick) {
        self.0.store(now, Ordering::Release);
    }
}

/// Signals that trigger a graceful shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// Resolves on the first shutdown signal.
pub async fn shutdown_signal() -> Signal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => Signal::Interrupt,
                _ = term.recv() => Signal::Terminate,
            },
            Err(e) => {
                tracing::warn!("[server] [signal] SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                Signal::Interrupt
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        Signal::Interrupt
    }
}

/// Checks applied to every accepted connection before a session exists.
struct Gate {
    blacklist: Blacklist,
    throttle: ConnectThrottle,
}

impl Gate {
    fn admit(&self, peer: &SocketAddr) -> bool {
        if self.blacklist.is_blocked(peer.ip()) {
            tracing::info!("[server] [accept] rejected blacklisted peer={}", peer);
            return false;
        }
        if !self.throttle.record(peer.ip()) {
            tracing::info!("[server] [accept] throttled peer={}", peer);
            return false;
        }
        true
    }
}

/// The running server: both listeners plus the world actor.
pub struct Server {
    config: Arc<ServerConfig>,
    clock: Clock,
    registry: Arc<SessionRegistry>,
    world: WorldHandle,
    world_task: JoinHandle<()>,
    login: TcpListener,
    game: TcpListener,
    login_addr: SocketAddr,
    game_addr: SocketAddr,
}

impl Server {
    /// Loads the latest save (or provisions an empty world), starts the
    /// world actor and binds both listeners.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let config = Arc::new(config);
        let clock = Clock::new();
        let registry = Arc::new(SessionRegistry::new(config.ticks_per_second));

        let templates = match &config.templates_file {
            Some(path) => TemplateManager::load(path)?,
            None => TemplateManager::builtin(),
        };

        let saves = SaveManager::new(&config.save_dir);
        let loaded = saves
            .load()
            .with_context(|| format!("Failed to load the latest save in {}", config.save_dir))?;

        let mut world = World::new(config.clone(), clock.clone(), registry.clone(), templates, saves);
        match loaded {
            Some(loaded) => world.restore(loaded),
            None => tracing::info!(
                "[server] [startup] no save found in {}, starting an empty world",
                config.save_dir
            ),
        }

        let login = TcpListener::bind((config.login_ip.as_str(), config.login_port))
            .await
            .with_context(|| format!("Failed to bind login port {}:{}", config.login_ip, config.login_port))?;
        let game = TcpListener::bind((config.game_bind_ip.as_str(), config.game_port))
            .await
            .with_context(|| format!("Failed to bind game port {}:{}", config.game_bind_ip, config.game_port))?;
        let login_addr = login.local_addr()?;
        let game_addr = game.local_addr()?;

        let (handle, requests) = world::channel(config.request_queue_depth);
        let world_task = tokio::spawn(world.run(requests));

        tracing::info!(
            "[server] [startup] login={} game={} tps={}",
            login_addr,
            game_addr,
            config.ticks_per_second
        );

        Ok(Self {
            config,
            clock,
            registry,
            world: handle,
            world_task,
            login,
            game,
            login_addr,
            game_addr,
        })
    }

    pub fn login_addr(&self) -> SocketAddr {
        self.login_addr
    }

    pub fn game_addr(&self) -> SocketAddr {
        self.game_addr
    }

    pub fn world(&self) -> WorldHandle {
        self.world.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accepts connections until `shutdown` resolves, then stops the
    /// listeners, lets the world save and stop, and drops every session.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ctx = SessionContext {
            config: self.config.clone(),
            world: self.world.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            limits: SessionLimits::from_config(&self.config),
        };
        let gate = Arc::new(Gate {
            blacklist: Blacklist::from_entries(&self.config.blacklist),
            throttle: ConnectThrottle::new(self.config.throttle_limit),
        });

        let login_task = tokio::spawn(accept_loop(self.login, Service::Login, ctx.clone(), gate.clone()));
        let game_task = tokio::spawn(accept_loop(self.game, Service::Game, ctx, gate.clone()));
        let sweep_task = tokio::spawn(throttle_sweep(
            gate,
            Duration::from_secs(self.config.throttle_window_secs.max(1)),
        ));

        shutdown.await;
        tracing::info!("[server] [shutdown] closing listeners");
        login_task.abort();
        game_task.abort();
        sweep_task.abort();

        if !self.world.shutdown().await {
            tracing::warn!("[server] [shutdown] world actor already stopped");
        }
        self.world_task.await.context("World actor panicked")?;

        self.registry.disconnect_all("server shutdown");
        tracing::info!("[server] [shutdown] complete");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, service: Service, ctx: SessionContext, gate: Arc<Gate>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("[server] [accept] service={:?} error={}", service, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if !gate.admit(&peer) {
            continue;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[server] [accept] peer={} nodelay failed: {}", peer, e);
        }
        let (reader, writer) = stream.into_split();
        tokio::spawn(session::serve(reader, writer, peer, service, ctx.clone()));
    }
}

async fn throttle_sweep(gate: Arc<Gate>, window: Duration) {
    if !gate.throttle.is_enabled() {
        return;
    }
    let mut interval = tokio::time::interval(window);
    interval.tick().await;
    loop {
        interval.tick().await;
        gate.throttle.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_shared() {
        let clock = Clock::new();
        let other = clock.clone();
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(other.now(), 2);
        other.set(40);
        assert_eq!(clock.now(), 40);
    }

    #[test]
    fn test_gate_rejects_blacklisted_and_throttled() {
        let gate = Gate {
            blacklist: Blacklist::from_entries(&["10.0.0.0/8"]),
            throttle: ConnectThrottle::new(1),
        };
        assert!(!gate.admit(&"10.1.1.1:1000".parse().unwrap()));
        assert!(gate.admit(&"192.168.0.1:1000".parse().unwrap()));
        assert!(!gate.admit(&"192.168.0.1:1001".parse().unwrap()));
        gate.throttle.reset();
        assert!(gate.admit(&"192.168.0.1:1002".parse().unwrap()));
    }
}
