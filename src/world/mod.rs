//! The world actor
//!
//! Exactly one task owns a [`World`] and is the only code that touches game
//! state. Sessions talk to it through a bounded queue of [`Request`]s; the
//! actor interleaves those with a fixed-rate tick, always taking a due tick
//! first so a flood of requests cannot stall world time.

mod handlers;
mod request;
mod update;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ServerConfig;
use crate::core::Clock;
use crate::game::{
    AccountManager, DeepStorage, GameMap, MapMeta, ObjectRef, ObjectStore, Serial, TemplateManager, Tick,
    Timer, TimerQueue, TimerRegistry,
};
use crate::protocol::ServerPacket;
use crate::save::{LoadedWorld, SaveError, SaveGuard, SaveManager, SaveSource};
use crate::session::{NetState, SessionRegistry};

pub use request::{AuthGrant, Request, RequestError};

/// Timer kind that moves a logged-out character into deep storage.
pub const REMOVE_PLAYER: &str = "RemovePlayer";
/// Timer kind for the periodic save.
pub const WORLD_SAVE: &str = "WorldSave";

/// Cloneable sender side of the request queue.
#[derive(Clone)]
pub struct WorldHandle {
    tx: mpsc::Sender<Request>,
}

pub fn channel(depth: usize) -> (WorldHandle, mpsc::Receiver<Request>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (WorldHandle { tx }, rx)
}

impl WorldHandle {
    /// Queues a request without waiting. A full or closed queue drops it.
    pub fn send_request(&self, request: Request) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                tracing::warn!("[world] [queue] full, dropping kind={}", request.kind());
                false
            }
            Err(TrySendError::Closed(request)) => {
                tracing::debug!("[world] [queue] closed, dropping kind={}", request.kind());
                false
            }
        }
    }

    /// Enqueues the shutdown sentinel behind everything already queued.
    pub async fn shutdown(&self) -> bool {
        self.tx.send(Request::Shutdown).await.is_ok()
    }

    /// Runs `f` inside the actor and returns its result.
    pub async fn query<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&World) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let request = Request::Query(Box::new(move |world| {
            let _ = tx.send(f(world));
        }));
        self.tx.send(request).await.ok()?;
        rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct World {
    config: Arc<ServerConfig>,
    clock: Clock,
    wall_clock: DateTime<Utc>,
    registry: Arc<SessionRegistry>,
    templates: TemplateManager,
    saves: SaveManager,

    store: ObjectStore,
    accounts: AccountManager,
    timers: TimerQueue,
    timer_handlers: TimerRegistry<World>,
    map: GameMap,
    deep: DeepStorage,

    /// Player mobile -> the session controlling it
    players: HashMap<Serial, Arc<NetState>>,
    /// Player mobile -> the item on its cursor
    held: HashMap<Serial, Serial>,

    updates: HashSet<Serial>,
    opl_updates: HashSet<Serial>,
}

impl World {
    /// An empty world; the first account created becomes superuser when
    /// `provision_superuser` is set.
    pub fn new(
        config: Arc<ServerConfig>,
        clock: Clock,
        registry: Arc<SessionRegistry>,
        templates: TemplateManager,
        saves: SaveManager,
    ) -> Self {
        let mut timer_handlers = TimerRegistry::new();
        timer_handlers.register(REMOVE_PLAYER, on_remove_player);
        timer_handlers.register(WORLD_SAVE, on_world_save);

        let map = GameMap::new(MapMeta {
            width: config.map_width,
            height: config.map_height,
        });

        Self {
            accounts: AccountManager::provisioning(config.provision_superuser),
            config,
            clock,
            wall_clock: Utc::now(),
            registry,
            templates,
            saves,
            store: ObjectStore::new(),
            timers: TimerQueue::new(),
            timer_handlers,
            map,
            deep: DeepStorage::new(),
            players: HashMap::new(),
            held: HashMap::new(),
            updates: HashSet::new(),
            opl_updates: HashSet::new(),
        }
    }

    /// Replaces all state with a loaded save.
    pub fn restore(&mut self, loaded: LoadedWorld) {
        self.clock.set(loaded.now);

        let mut store = ObjectStore::new();
        for object in loaded.objects {
            store.insert(object);
        }
        store.set_counters(loaded.last_mobile, loaded.last_item);
        store.recalculate();
        self.store = store;

        self.timers = TimerQueue::restore(loaded.timers);
        self.accounts = AccountManager::from_accounts(loaded.accounts);
        self.deep = loaded.deep;

        let mut map = GameMap::new(loaded.map);
        for (serial, location) in loaded.placements {
            if self.store.contains(serial) {
                map.force_add_object(serial, location);
            }
        }
        self.map = map;

        // items that were on a cursor at save time have no home
        let strays: Vec<Serial> = self
            .store
            .items()
            .filter(|i| i.on_ground() && !self.map.contains(i.serial))
            .map(|i| i.serial)
            .collect();
        for serial in &strays {
            self.store.take_tree(*serial);
        }

        // characters that were online at save time log out on the usual grace
        let online: Vec<Serial> = self
            .store
            .mobiles()
            .filter(|m| m.is_player())
            .map(|m| m.serial)
            .collect();
        for serial in &online {
            self.schedule_removal(*serial);
        }

        tracing::info!(
            "[world] [restore] path={} now={} objects={} accounts={} deep={} strays={} online={}",
            loaded.path.display(),
            loaded.now,
            self.store.len(),
            self.accounts.len(),
            self.deep.len(),
            strays.len(),
            online.len()
        );
        if let Some(su) = self.accounts.superuser() {
            tracing::info!("[world] [restore] superuser={}", su.username);
        }
    }

    // ============================================
    // Read-only views
    // ============================================

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub fn wall_clock(&self) -> DateTime<Utc> {
        self.wall_clock
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn find(&self, serial: Serial) -> Option<ObjectRef<'_>> {
        self.store.get(serial)
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn map(&self) -> &GameMap {
        &self.map
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn deep_storage(&self) -> &DeepStorage {
        &self.deep
    }

    pub fn session_of(&self, player: Serial) -> Option<&Arc<NetState>> {
        self.players.get(&player)
    }

    pub fn held_item(&self, player: Serial) -> Option<Serial> {
        self.held.get(&player).copied()
    }

    // ============================================
    // Actor loop
    // ============================================

    /// Runs until the shutdown sentinel (or every handle is gone), then
    /// saves and waits for the archive to hit the disk.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut ticker = tokio::time::interval(self.config.tick_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.arm_save_timer();
        tracing::info!("[world] [start] now={} tps={}", self.now(), self.config.ticks_per_second);

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => self.tick(),
                request = requests.recv() => match request {
                    None | Some(Request::Shutdown) => break,
                    Some(request) => self.execute(request),
                },
            }
        }

        tracing::info!("[world] [stop] now={} saving", self.now());
        if self.saves.is_busy() {
            tracing::info!("[world] [stop] waiting for the running save to finish");
        }
        let guard = self.saves.begin().await;
        report_save(self.write_save(guard).await);
    }

    /// Executes one request; failures are logged and echoed to the session.
    pub fn execute(&mut self, request: Request) {
        let kind = request.kind();
        let session = request.session().cloned();
        if let Err(e) = request.execute(self) {
            tracing::warn!("[world] [request] kind={} error={}", kind, e);
            if let Some(session) = session {
                session.send(ServerPacket::system(e.to_string()));
            }
        }
    }

    /// One logical tick.
    pub fn tick(&mut self) {
        let now = self.clock.advance();
        self.wall_clock = Utc::now();
        self.fire_due_timers(now);
        self.registry.update(now);
        self.update_chunks(now);
        self.think(now);
        self.flush_updates();
    }

    fn fire_due_timers(&mut self, now: Tick) {
        for timer in self.timers.take_due(now) {
            match self.timer_handlers.get(&timer.kind) {
                Some(handler) => handler(self, &timer),
                None => tracing::warn!(
                    "[world] [timer] no handler kind={} subject={}",
                    timer.kind,
                    timer.subject
                ),
            }
        }
    }

    /// Ground-item decay, one slice of chunks per tick.
    fn update_chunks(&mut self, now: Tick) {
        let lifetime = self.config.ticks(self.config.decay_secs);
        if lifetime == 0 {
            return;
        }
        let expired: Vec<Serial> = self
            .map
            .chunk_items_due(now, self.config.ticks_per_second)
            .into_iter()
            .filter(|s| {
                self.store
                    .item(*s)
                    .is_some_and(|i| i.on_ground() && now.saturating_sub(i.dropped_at) >= lifetime)
            })
            .collect();
        for serial in expired {
            tracing::debug!("[world] [decay] item={}", serial);
            self.delete_object(serial);
        }
    }

    /// Hit point regeneration, each mobile once per logical second.
    fn think(&mut self, now: Tick) {
        let tps = self.config.ticks_per_second.max(1);
        let slot = now % tps;
        let mut healed = Vec::new();
        for mobile in self.store.mobiles_mut() {
            if u64::from(mobile.serial.0) % tps != slot || mobile.hits >= mobile.max_hits {
                continue;
            }
            mobile.hits += 1;
            healed.push(mobile.serial);
        }
        for serial in healed {
            if let (Some(session), Some(status)) = (self.players.get(&serial), self.status_packet(serial, false)) {
                session.send(status);
            }
        }
    }

    // ============================================
    // Persistence
    // ============================================

    /// Starts a save unless one is already running. The returned task
    /// finishes once the archive is on disk.
    pub fn save(&self) -> Option<JoinHandle<Result<PathBuf, SaveError>>> {
        let Some(guard) = self.saves.try_begin() else {
            tracing::info!("[world] [save] skipped, another save is running");
            return None;
        };
        Some(self.write_save(guard))
    }

    fn write_save(&self, guard: SaveGuard) -> JoinHandle<Result<PathBuf, SaveError>> {
        self.registry
            .broadcast(&ServerPacket::system("The world is saving, please wait."));
        let source = SaveSource {
            now: self.now(),
            store: &self.store,
            accounts: &self.accounts,
            timers: &self.timers,
            map: &self.map,
            deep: &self.deep,
        };
        guard.write(&source)
    }

    fn arm_save_timer(&mut self) {
        self.timers.cancel_matching(WORLD_SAVE, Serial::NONE);
        if self.config.save_interval_secs == 0 {
            return;
        }
        let delay = self.config.ticks(self.config.save_interval_secs);
        self.timers.schedule(self.now(), delay, WORLD_SAVE, Serial::NONE, "");
    }

    fn schedule_removal(&mut self, player: Serial) {
        self.timers.cancel_matching(REMOVE_PLAYER, player);
        let grace = self.config.ticks(self.config.logout_grace_secs);
        self.timers.schedule(self.now(), grace, REMOVE_PLAYER, player, "");
    }

    /// Moves an offline character and everything it carries off the map.
    fn move_to_deep_storage(&mut self, player: Serial) {
        if self.players.contains_key(&player) {
            tracing::debug!("[world] [logout] player={} came back, staying in world", player);
            return;
        }
        if self.store.mobile(player).is_none() {
            return;
        }
        self.send_delete(player, None);
        self.map.remove_object(player);
        let tree = self.store.take_tree(player);
        for object in &tree {
            self.forget(object.serial());
        }
        tracing::info!(
            "[world] [logout] player={} objects={} moved to deep storage",
            player,
            tree.len()
        );
        self.deep.insert(player, tree);
    }

    /// Removes an object and its whole tree from the world.
    pub fn delete_object(&mut self, serial: Serial) -> usize {
        let Some(parent) = self.find(serial).map(|o| match o {
            ObjectRef::Item(i) => i.parent,
            ObjectRef::Mobile(_) => Serial::NONE,
        }) else {
            return 0;
        };
        self.send_delete(serial, None);
        self.map.remove_object(serial);
        let removed = self.store.take_tree(serial);
        for object in &removed {
            self.forget(object.serial());
        }
        if !parent.is_none() {
            self.store.recalculate();
            self.touch_containers(parent);
        }
        removed.len()
    }

    /// Drops every reference the world keeps to a serial that is gone.
    fn forget(&mut self, serial: Serial) {
        self.updates.remove(&serial);
        self.opl_updates.remove(&serial);
        self.held.retain(|_, item| *item != serial);
        for session in self.players.values() {
            session.stop_observing(serial);
        }
    }
}

fn on_remove_player(world: &mut World, timer: &Timer) {
    world.move_to_deep_storage(timer.subject);
}

fn on_world_save(world: &mut World, _timer: &Timer) {
    if let Some(task) = world.save() {
        tokio::spawn(async move { report_save(task.await) });
    }
    world.arm_save_timer();
}

fn report_save(result: Result<Result<PathBuf, SaveError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(path)) => tracing::info!("[world] [save] wrote {}", path.display()),
        Ok(Err(e)) => tracing::error!("[world] [save] failed: {}", e),
        Err(e) => tracing::error!("[world] [save] task failed: {}", e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::game::{Item, Location, Object};
    use crate::session::SessionLimits;
    use std::net::SocketAddr;

    pub(crate) fn test_config() -> ServerConfig {
        ServerConfig {
            map_width: 512,
            map_height: 512,
            start_location: Location::new(100, 100, 0),
            save_interval_secs: 0,
            save_dir: std::env::temp_dir()
                .join(format!("uod_world_{}_{}", std::process::id(), rand::random::<u32>()))
                .to_string_lossy()
                .into_owned(),
            ..ServerConfig::default()
        }
    }

    pub(crate) fn test_world() -> World {
        let config = Arc::new(test_config());
        let registry = Arc::new(SessionRegistry::new(config.ticks_per_second));
        let saves = SaveManager::new(&config.save_dir);
        World::new(config, Clock::new(), registry, TemplateManager::builtin(), saves)
    }

    pub(crate) fn limits() -> SessionLimits {
        SessionLimits {
            login_idle: 1_000,
            game_idle: 1_000,
            target_timeout: 50,
            action_delay: 0,
            outbound_depth: 256,
        }
    }

    pub(crate) fn open_session(
        world: &World,
    ) -> (Arc<NetState>, mpsc::Receiver<ServerPacket>) {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        world.registry.open(peer, world.clock.clone(), limits())
    }

    pub(crate) fn drain(rx: &mut mpsc::Receiver<ServerPacket>) -> Vec<ServerPacket> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    /// Logs `username` in on a fresh session and returns its player serial.
    pub(crate) fn enter(
        world: &mut World,
        username: &str,
    ) -> (Arc<NetState>, mpsc::Receiver<ServerPacket>, Serial) {
        let (session, mut rx) = open_session(world);
        world
            .accounts
            .authenticate_or_create(username, &crate::game::hash_password("pw"))
            .unwrap();
        session.set_account(username);
        world.character_login(&session, 0).unwrap();
        drain(&mut rx);
        let player = session.player().unwrap();
        (session, rx, player)
    }

    pub(crate) fn ground_item(world: &mut World, at: Location) -> Serial {
        let serial = world.store.allocate_item_serial();
        let mut item = Item::new(serial, "Gold", "gold coin", 0x0EED);
        item.location = at;
        world.store.insert(Object::Item(item));
        world.map.force_add_object(serial, at);
        serial
    }

    #[test]
    fn test_handle_reports_full_queue() {
        let (handle, _rx) = channel(1);
        assert!(handle.send_request(Request::CharacterLogout { player: Serial(1) }));
        assert!(!handle.send_request(Request::CharacterLogout { player: Serial(2) }));
    }

    #[test]
    fn test_handle_reports_closed_queue() {
        let (handle, rx) = channel(4);
        drop(rx);
        assert!(handle.is_closed());
        assert!(!handle.send_request(Request::Shutdown));
    }

    #[tokio::test]
    async fn test_tick_advances_clock_and_fires_timers() {
        let mut world = test_world();
        let (_s, _rx, player) = enter(&mut world, "bob");
        world.players.clear();
        world.schedule_removal(player);
        let grace = world.config.ticks(world.config.logout_grace_secs);

        for _ in 0..grace {
            world.tick();
        }
        assert_eq!(world.now(), grace);
        assert!(world.store.mobile(player).is_none());
        assert!(world.deep.contains_key(&player));
        assert!(!world.map.contains(player));
    }

    #[tokio::test]
    async fn test_logout_then_login_restores_from_deep_storage() {
        let mut world = test_world();
        let (session, _rx, player) = enter(&mut world, "carol");
        let carried = world.store.collect_tree(player).len();

        session.disconnect("test");
        world.character_logout(session.take_player().unwrap());
        assert!(world.timers.len() >= 1);
        for _ in 0..world.config.ticks(world.config.logout_grace_secs) {
            world.tick();
        }
        assert!(world.store.mobile(player).is_none());

        let (again, _rx2, same) = enter(&mut world, "carol");
        assert_eq!(same, player);
        assert_eq!(world.store.collect_tree(player).len(), carried);
        assert!(world.deep.is_empty());
        assert!(Arc::ptr_eq(world.session_of(player).unwrap(), &again));
    }

    #[tokio::test]
    async fn test_relogin_within_grace_cancels_removal() {
        let mut world = test_world();
        let (session, _rx, player) = enter(&mut world, "dave");
        session.disconnect("test");
        world.character_logout(session.take_player().unwrap());

        let (_again, _rx2, same) = enter(&mut world, "dave");
        assert_eq!(same, player);
        for _ in 0..world.config.ticks(world.config.logout_grace_secs) + 1 {
            world.tick();
        }
        assert!(world.store.mobile(player).is_some());
        assert!(world.deep.is_empty());
    }

    #[tokio::test]
    async fn test_stale_logout_is_ignored() {
        let mut world = test_world();
        let (_session, _rx, player) = enter(&mut world, "erin");
        world.character_logout(player);
        assert!(world.timers.is_empty());
        assert!(world.session_of(player).is_some());
    }

    #[tokio::test]
    async fn test_ground_items_decay() {
        let mut world = test_world();
        let lifetime = world.config.ticks(world.config.decay_secs);
        let coin = ground_item(&mut world, Location::new(50, 50, 0));
        world.clock.set(lifetime);
        for _ in 0..world.config.ticks_per_second {
            world.tick();
        }
        assert!(world.find(coin).is_none());
        assert!(!world.map.contains(coin));
    }

    #[tokio::test]
    async fn test_request_error_is_echoed_to_session() {
        let mut world = test_world();
        let (session, mut rx) = open_session(&world);
        world.execute(Request::CharacterLogin { session: session.clone(), slot: 0 });
        match drain(&mut rx).as_slice() {
            [ServerPacket::AsciiMessage { text, .. }] => {
                assert_eq!(text, &RequestError::NoAccount.to_string())
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_answers_query_and_saves_on_shutdown() {
        let world = test_world();
        let dir = world.config.save_dir.clone();
        let (handle, rx) = channel(16);
        let task = tokio::spawn(world.run(rx));

        let accounts = handle.query(|w| w.accounts().len()).await;
        assert_eq!(accounts, Some(0));

        assert!(handle.shutdown().await);
        task.await.unwrap();
        let archives = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(archives, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_save() {
        let mut world = test_world();
        let dir = world.config.save_dir.clone();
        let saves = world.saves.clone();
        let busy = saves.try_begin().unwrap();
        world.authenticate("alice", &crate::game::hash_password("pw1")).unwrap();

        let (handle, rx) = channel(16);
        let task = tokio::spawn(world.run(rx));
        assert!(handle.shutdown().await);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        drop(busy);
        task.await.unwrap();
        let loaded = saves.load().unwrap().unwrap();
        assert!(loaded.accounts.iter().any(|a| a.username == "alice"));
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_tick_runs_before_queued_requests() {
        for _ in 0..8 {
            let world = test_world();
            let dir = world.config.save_dir.clone();
            let start = world.now();
            let (handle, rx) = channel(128);
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            for _ in 0..64 {
                let seen = seen.clone();
                assert!(handle.send_request(Request::Query(Box::new(move |w| {
                    seen.lock().unwrap().push(w.now());
                }))));
            }

            let task = tokio::spawn(world.run(rx));
            assert!(handle.shutdown().await);
            task.await.unwrap();

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 64);
            assert!(seen[0] > start, "a request ran before the due tick");
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
