//! Per-connection sessions
//!
//! Every accepted connection gets a [`NetState`] shared by three parties:
//! the read task, the write task and the world actor. The read task frames
//! and decodes inbound packets and routes them; the write task drains the
//! bounded outbound queue onto the socket. A supervisor awaits both and
//! turns any exit, panics included, into one disconnect.

pub mod registry;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinError;

use crate::config::ServerConfig;
use crate::core::Clock;
use crate::game::{Serial, Tick};
use crate::network::{self, huffman, FrameError, Framer, ReadError, PREAMBLE_LEN};
use crate::protocol::{ClientPacket, DecodeError, GumpResponse, ServerPacket, TargetPacket};
use crate::servers;
use crate::world::{Request, World, WorldHandle};

pub use registry::SessionRegistry;

/// How long the write task may keep draining after a disconnect before the
/// socket is dropped under it.
pub const CLOSE_LINGER: Duration = Duration::from_millis(500);

/// Runs inside the world actor when the client answers a cursor.
pub type TargetCallback = Box<dyn FnOnce(&mut World, &TargetPacket) + Send>;

/// Runs inside the world actor when the client answers an open gump.
pub type GumpHandler = Box<dyn FnOnce(&mut World, &GumpResponse) + Send>;

/// Reasons a session's read task ends.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No data for {0:?}")]
    ReadTimeout(Duration),

    #[error("Client requested disconnect")]
    ClientDisconnect,

    #[error("World is not accepting requests")]
    WorldUnavailable,
}

impl From<ReadError> for SessionError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Frame(e) => SessionError::Frame(e),
            ReadError::Io(e) => SessionError::Io(e),
        }
    }
}

/// Timeouts in logical ticks, derived once from the config.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Before a character is attached
    pub login_idle: Tick,
    /// While in the world
    pub game_idle: Tick,
    pub target_timeout: Tick,
    pub action_delay: Tick,
    pub outbound_depth: usize,
}

impl SessionLimits {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            login_idle: config.ticks(config.login_idle_secs),
            game_idle: config.ticks(config.game_idle_secs),
            target_timeout: config.ticks(config.target_timeout_secs),
            action_delay: config.ticks_ms(config.action_delay_ms),
            outbound_depth: config.outbound_queue_depth,
        }
    }
}

/// Which listener accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Login,
    Game,
}

/// Everything a session task needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub world: WorldHandle,
    pub registry: Arc<SessionRegistry>,
    pub clock: Clock,
    pub limits: SessionLimits,
}

struct PendingTarget {
    cursor_id: u32,
    expires: Tick,
    callback: TargetCallback,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct NetState {
    id: u64,
    peer: SocketAddr,
    group: u64,
    clock: Clock,
    limits: SessionLimits,

    /// None once disconnected; dropping the sender stops the write task
    outbound: Mutex<Option<mpsc::Sender<ServerPacket>>>,
    closed: Notify,
    disconnected: AtomicBool,
    compression: AtomicBool,

    account: Mutex<Option<String>>,
    player: Mutex<Option<Serial>>,
    deadline: AtomicU64,
    next_action: AtomicU64,

    target: Mutex<Option<PendingTarget>>,
    next_cursor: AtomicU32,
    gumps: Mutex<HashMap<u32, GumpHandler>>,
    observed: Mutex<HashSet<Serial>>,

    registry: Weak<SessionRegistry>,
}

impl std::fmt::Debug for NetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetState")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("player", &self.player())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl NetState {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        group: u64,
        clock: Clock,
        limits: SessionLimits,
        registry: Weak<SessionRegistry>,
    ) -> (Arc<Self>, mpsc::Receiver<ServerPacket>) {
        let (tx, rx) = mpsc::channel(limits.outbound_depth.max(1));
        let deadline = clock.now().saturating_add(limits.login_idle);
        let session = Arc::new(Self {
            id,
            peer,
            group,
            clock,
            limits,
            outbound: Mutex::new(Some(tx)),
            closed: Notify::new(),
            disconnected: AtomicBool::new(false),
            compression: AtomicBool::new(false),
            account: Mutex::new(None),
            player: Mutex::new(None),
            deadline: AtomicU64::new(deadline),
            next_action: AtomicU64::new(0),
            target: Mutex::new(None),
            next_cursor: AtomicU32::new(0),
            gumps: Mutex::new(HashMap::new()),
            observed: Mutex::new(HashSet::new()),
            registry,
        });
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn group(&self) -> u64 {
        self.group
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    // ============================================
    // Outbound
    // ============================================

    /// Queues a packet without waiting. False means the client is too slow
    /// (queue full) or gone; the packet is dropped.
    pub fn send(&self, packet: ServerPacket) -> bool {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(packet)) => {
                tracing::warn!(
                    "[session] [overload] id={} dropped packet={:#04X}",
                    self.id,
                    packet.id()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// `None` is a successful no-op.
    pub fn send_optional(&self, packet: Option<ServerPacket>) -> bool {
        packet.map_or(true, |p| self.send(p))
    }

    /// Compresses every packet written from now on. Never turns back off.
    pub fn enable_compression(&self) {
        self.compression.store(true, Ordering::Release);
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression.load(Ordering::Acquire)
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Tears the session down. Only the first call does anything; it
    /// returns true for that call.
    ///
    /// Observers are recorded only on the session, so clearing the set
    /// detaches it from every container it had open. Both connection tasks
    /// are woken: the read half stops at once and the write half gets
    /// [`CLOSE_LINGER`] to push out what is already queued before the
    /// socket is dropped.
    ///
    /// The player is left attached. Whoever sees the tasks exit takes it
    /// and posts the logout to the world.
    pub fn disconnect(&self, reason: &str) -> bool {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!(
            "[session] [disconnect] id={} peer={} reason={}",
            self.id,
            self.peer,
            reason
        );

        lock(&self.observed).clear();
        lock(&self.outbound).take();
        self.closed.notify_waiters();
        lock(&self.target).take();
        lock(&self.gumps).clear();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        true
    }

    /// Resolves once [`disconnect`](Self::disconnect) has run.
    async fn wait_closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_disconnected() {
            return;
        }
        notified.await;
    }

    /// Pushes the idle deadline out from the current logical time.
    pub fn refresh_deadline(&self) {
        let idle = if self.player().is_some() {
            self.limits.game_idle
        } else {
            self.limits.login_idle
        };
        self.deadline
            .store(self.clock.now().saturating_add(idle), Ordering::Release);
    }

    pub fn deadline(&self) -> Tick {
        self.deadline.load(Ordering::Acquire)
    }

    /// Periodic health check: idle timeout and cursor expiry.
    pub fn update(&self, now: Tick) {
        if self.is_disconnected() {
            return;
        }
        if now > self.deadline() {
            self.disconnect("idle");
            return;
        }

        let expired = {
            let mut target = lock(&self.target);
            match target.as_ref() {
                Some(t) if now > t.expires => target.take(),
                _ => None,
            }
        };
        if let Some(t) = expired {
            tracing::debug!("[session] [target] id={} cursor={} expired", self.id, t.cursor_id);
            self.send(ServerPacket::Target(TargetPacket::cancel(t.cursor_id)));
        }
    }

    // ============================================
    // Account and player binding
    // ============================================

    pub fn set_account(&self, username: &str) {
        *lock(&self.account) = Some(username.to_string());
    }

    pub fn account(&self) -> Option<String> {
        lock(&self.account).clone()
    }

    pub fn attach_player(&self, serial: Serial) {
        *lock(&self.player) = Some(serial);
        self.refresh_deadline();
    }

    pub fn player(&self) -> Option<Serial> {
        *lock(&self.player)
    }

    pub fn take_player(&self) -> Option<Serial> {
        lock(&self.player).take()
    }

    /// Rate limit for double-click, lift and friends.
    pub fn try_action(&self, now: Tick) -> bool {
        let next = self.next_action.load(Ordering::Acquire);
        if now < next {
            return false;
        }
        self.next_action
            .store(now.saturating_add(self.limits.action_delay), Ordering::Release);
        true
    }

    // ============================================
    // Targeting cursor
    // ============================================

    /// Shows a cursor; a cursor already out is silently replaced.
    pub fn target_send_cursor(&self, kind: u8, callback: TargetCallback) -> u32 {
        let cursor_id = self.next_cursor.fetch_add(1, Ordering::Relaxed) + 1;
        let expires = self.clock.now().saturating_add(self.limits.target_timeout);
        *lock(&self.target) = Some(PendingTarget {
            cursor_id,
            expires,
            callback,
        });
        self.send(ServerPacket::Target(TargetPacket::cursor(kind, cursor_id)));
        cursor_id
    }

    pub fn has_pending_target(&self) -> bool {
        lock(&self.target).is_some()
    }

    /// Hands back the callback to run, if the response is for the current
    /// cursor, arrived in time and is not a cancel. The slot is cleared
    /// unless the response was for some older cursor.
    pub fn target_response(&self, response: &TargetPacket, now: Tick) -> Option<TargetCallback> {
        let mut slot = lock(&self.target);
        match slot.as_ref() {
            Some(t) if t.cursor_id == response.cursor_id => {}
            _ => return None,
        }
        let pending = slot.take()?;
        drop(slot);

        if now > pending.expires || response.is_cancel() {
            return None;
        }
        Some(pending.callback)
    }

    // ============================================
    // Gumps and observed containers
    // ============================================

    pub fn gump_open(&self, type_id: u32, handler: GumpHandler) {
        lock(&self.gumps).insert(type_id, handler);
    }

    /// Removes the gump; its handler is returned only if it was open.
    pub fn gump_close(&self, type_id: u32) -> Option<GumpHandler> {
        lock(&self.gumps).remove(&type_id)
    }

    pub fn is_gump_open(&self, type_id: u32) -> bool {
        lock(&self.gumps).contains_key(&type_id)
    }

    pub fn observe(&self, container: Serial) -> bool {
        lock(&self.observed).insert(container)
    }

    pub fn stop_observing(&self, container: Serial) -> bool {
        lock(&self.observed).remove(&container)
    }

    pub fn is_observing(&self, container: Serial) -> bool {
        lock(&self.observed).contains(&container)
    }

    pub fn retain_observed<F: FnMut(&Serial) -> bool>(&self, f: F) {
        lock(&self.observed).retain(f);
    }
}

// ============================================
// Connection tasks
// ============================================

/// Runs one connection until it ends, then posts the logout if a player
/// was attached.
pub async fn serve<R, W>(reader: R, writer: W, peer: SocketAddr, service: Service, ctx: SessionContext)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, rx) = ctx.registry.open(peer, ctx.clock.clone(), ctx.limits);
    tracing::info!(
        "[session] [open] id={} peer={} service={:?}",
        session.id(),
        peer,
        service
    );

    let flush = Duration::from_millis(ctx.config.flush_interval_ms.max(1));
    let world = ctx.world.clone();
    let mut read_task = tokio::spawn(read_loop(session.clone(), reader, service, ctx));
    let mut write_task = tokio::spawn(write_loop(session.clone(), writer, rx, flush));

    let read_first = tokio::select! {
        res = &mut read_task => {
            report_exit(&session, "read", res);
            true
        }
        res = &mut write_task => {
            report_exit(&session, "write", res.map(|r| r.map_err(SessionError::Io)));
            false
        }
    };

    session.disconnect("connection closed");
    if read_first {
        report_exit(&session, "write", write_task.await.map(|r| r.map_err(SessionError::Io)));
    } else {
        report_exit(&session, "read", read_task.await);
    }

    if let Some(player) = session.take_player() {
        if !world.send_request(Request::CharacterLogout { player }) {
            tracing::warn!(
                "[session] [logout] id={} player={} could not be queued",
                session.id(),
                player
            );
        }
    }
}

fn report_exit(session: &NetState, task: &str, res: Result<Result<(), SessionError>, JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(SessionError::Frame(e))) => {
            tracing::warn!("[session] [{}] id={} framing error: {}", task, session.id(), e)
        }
        Ok(Err(e)) => tracing::debug!("[session] [{}] id={} ended: {}", task, session.id(), e),
        Err(e) if e.is_panic() => {
            tracing::error!("[session] [{}] id={} task panicked", task, session.id())
        }
        Err(e) => tracing::debug!("[session] [{}] id={} task cancelled: {}", task, session.id(), e),
    }
}

async fn read_loop<R>(
    session: Arc<NetState>,
    mut reader: R,
    service: Service,
    ctx: SessionContext,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut framer = Framer::with_preamble(PREAMBLE_LEN);
    let read_timeout = Duration::from_secs(ctx.config.socket_read_timeout_secs.max(1));

    loop {
        let raw = tokio::select! {
            _ = session.wait_closed() => return Ok(()),
            res = tokio::time::timeout(read_timeout, network::read_packet(&mut reader, &mut framer)) => {
                match res {
                    Err(_) => return Err(SessionError::ReadTimeout(read_timeout)),
                    Ok(r) => match r? {
                        Some(raw) => raw,
                        None => return Ok(()),
                    },
                }
            }
        };

        session.refresh_deadline();

        let packet = match ClientPacket::decode(&raw) {
            Ok(packet) => packet,
            Err(DecodeError::Unsupported(id)) => {
                tracing::debug!(
                    "[session] [read] id={} unsupported packet={:#04X} len={}",
                    session.id(),
                    id,
                    raw.len()
                );
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        servers::dispatch(service, &session, packet, &ctx).await?;
    }
}

async fn write_loop<W>(
    session: Arc<NetState>,
    writer: W,
    mut rx: mpsc::Receiver<ServerPacket>,
    flush_interval: Duration,
) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let drain = drain_outbound(&session, writer, &mut rx, flush_interval);
    let linger = async {
        session.wait_closed().await;
        tokio::time::sleep(CLOSE_LINGER).await;
    };

    tokio::select! {
        res = drain => res,
        _ = linger => {
            tracing::debug!(
                "[session] [write] id={} peer stopped reading, dropping socket",
                session.id()
            );
            Ok(())
        }
    }
}

async fn drain_outbound<W>(
    session: &NetState,
    writer: W,
    rx: &mut mpsc::Receiver<ServerPacket>,
    flush_interval: Duration,
) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BufWriter::with_capacity(16 * 1024, writer);
    let mut packet_buf = BytesMut::with_capacity(4096);
    let mut packed: Vec<u8> = Vec::with_capacity(4096);
    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending = false;

    loop {
        tokio::select! {
            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                packet_buf.clear();
                packet.encode(&mut packet_buf);
                if packet_buf.is_empty() {
                    continue;
                }
                if session.compression_enabled() {
                    packed.clear();
                    huffman::compress_into(&packet_buf, &mut packed);
                    out.write_all(&packed).await?;
                } else {
                    out.write_all(&packet_buf).await?;
                }
                pending = true;
            }
            _ = flush.tick() => {
                if pending {
                    out.flush().await?;
                    pending = false;
                }
            }
        }
    }

    out.flush().await?;
    out.shutdown().await
}
