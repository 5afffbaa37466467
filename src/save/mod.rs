//! World snapshots
//!
//! A save encodes every section in memory on a rayon scope (one task per
//! fixed section plus one per object shard), then hands the buffers to a
//! blocking task that writes `<timestamp>.tmp` and renames it to
//! `<timestamp>.uos`. The try-lock is held until that rename finishes, so a
//! save requested while another is writing is a no-op.

pub mod archive;

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::game::{
    Account, AccountManager, DeepStorage, GameMap, Location, MapMeta, Object, ObjectStore, Serial,
    Tick, Timer, TimerQueue,
};
use archive::Section;

pub const ARCHIVE_EXT: &str = "uos";

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Section {section}: {source}")]
    Yaml {
        section: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    #[error("Archive has no {0} section")]
    MissingSection(String),

    #[error("A save or load is already running")]
    Busy,

    #[error("Save task failed: {0}")]
    Task(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct GlobalSection {
    now: Tick,
    last_mobile: u32,
    last_item: u32,
    shards: usize,
    saved_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MapSection {
    meta: MapMeta,
    placements: Vec<(Serial, Location)>,
}

/// Borrowed view of everything a save writes.
pub struct SaveSource<'a> {
    pub now: Tick,
    pub store: &'a ObjectStore,
    pub accounts: &'a AccountManager,
    pub timers: &'a TimerQueue,
    pub map: &'a GameMap,
    pub deep: &'a DeepStorage,
}

/// Decoded archive contents, in the order they are restored.
#[derive(Debug)]
pub struct LoadedWorld {
    pub path: PathBuf,
    pub now: Tick,
    pub last_mobile: u32,
    pub last_item: u32,
    pub timers: Vec<Timer>,
    pub accounts: Vec<Account>,
    pub deep: DeepStorage,
    pub objects: Vec<Object>,
    pub map: MapMeta,
    pub placements: Vec<(Serial, Location)>,
}

pub fn shard_name(index: usize) -> String {
    format!("objects-{:03}", index)
}

fn encode<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<Section, SaveError> {
    let yaml = serde_yaml::to_string(value).map_err(|source| SaveError::Yaml {
        section: name.to_string(),
        source,
    })?;
    Section::compress(name, yaml.as_bytes())
}

fn decode<T: DeserializeOwned>(sections: &HashMap<String, Section>, name: &str) -> Result<T, SaveError> {
    let section = sections
        .get(name)
        .ok_or_else(|| SaveError::MissingSection(name.to_string()))?;
    let yaml = section.decompress()?;
    serde_yaml::from_slice(&yaml).map_err(|source| SaveError::Yaml {
        section: name.to_string(),
        source,
    })
}

/// Encodes every section concurrently. Shard `k` holds the objects at
/// sorted positions `k, k + n, k + 2n, ...`.
fn encode_sections(source: &SaveSource<'_>, shards: usize) -> Result<Vec<Section>, SaveError> {
    let shards = shards.max(1);
    let serials = source.store.sorted_serials();
    let (last_mobile, last_item) = source.store.counters();

    let mut global = None;
    let mut timers = None;
    let mut accounts = None;
    let mut map = None;
    let mut deep = None;
    let mut objects: Vec<Option<Result<Section, SaveError>>> = (0..shards).map(|_| None).collect();

    rayon::scope(|s| {
        s.spawn(|_| {
            global = Some(encode(
                "global",
                &GlobalSection {
                    now: source.now,
                    last_mobile,
                    last_item,
                    shards,
                    saved_at: chrono::Utc::now().to_rfc3339(),
                },
            ))
        });
        s.spawn(|_| timers = Some(encode("timers", &source.timers.snapshot())));
        s.spawn(|_| accounts = Some(encode("accounts", &source.accounts.snapshot())));
        s.spawn(|_| {
            map = Some(encode(
                "map",
                &MapSection {
                    meta: source.map.meta(),
                    placements: source.map.placements(),
                },
            ))
        });
        s.spawn(|_| deep = Some(encode("deep-storage", source.deep)));

        for (index, slot) in objects.iter_mut().enumerate() {
            let serials = &serials;
            s.spawn(move |_| {
                let shard: Vec<Object> = serials
                    .iter()
                    .skip(index)
                    .step_by(shards)
                    .filter_map(|serial| source.store.get(*serial))
                    .map(|o| o.to_object())
                    .collect();
                *slot = Some(encode(&shard_name(index), &shard));
            });
        }
    });

    let missing = |name: &str| SaveError::Task(format!("{} was not encoded", name));
    let mut out = Vec::with_capacity(shards + 5);
    out.push(global.ok_or_else(|| missing("global"))??);
    out.push(timers.ok_or_else(|| missing("timers"))??);
    out.push(accounts.ok_or_else(|| missing("accounts"))??);
    for (index, slot) in objects.into_iter().enumerate() {
        out.push(slot.ok_or_else(|| missing(&shard_name(index)))??);
    }
    out.push(map.ok_or_else(|| missing("map"))??);
    out.push(deep.ok_or_else(|| missing("deep-storage"))??);
    Ok(out)
}

/// Picks a file name that does not exist yet.
fn archive_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
    let mut path = dir.join(format!("{}.{}", stamp, ARCHIVE_EXT));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}-{}.{}", stamp, n, ARCHIVE_EXT));
        n += 1;
    }
    path
}

fn write_archive(dir: &Path, sections: &[Section]) -> Result<PathBuf, SaveError> {
    fs::create_dir_all(dir)?;
    let path = archive_path(dir);
    let tmp = path.with_extension("tmp");
    let bytes = archive::encode_archive(sections);

    let written = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(path)
}

/// Holds the save lock; dropping it releases the lock.
pub struct SaveGuard {
    _permit: OwnedMutexGuard<()>,
    dir: PathBuf,
    shards: usize,
}

impl SaveGuard {
    /// Encodes on the calling thread, then writes in the background.
    /// The lock stays held until the returned task finishes.
    pub fn write(self, source: &SaveSource<'_>) -> JoinHandle<Result<PathBuf, SaveError>> {
        let started = Instant::now();
        let encoded = encode_sections(source, self.shards);
        let encode_ms = started.elapsed().as_millis();

        tokio::task::spawn_blocking(move || {
            let sections = encoded?;
            let path = write_archive(&self.dir, &sections)?;
            tracing::info!(
                "[save] [complete] path={} sections={} encode_ms={} total_ms={}",
                path.display(),
                sections.len(),
                encode_ms,
                started.elapsed().as_millis()
            );
            drop(self);
            Ok(path)
        })
    }
}

#[derive(Debug, Clone)]
pub struct SaveManager {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
    shards: usize,
}

impl SaveManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let shards = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            dir: dir.as_ref().to_path_buf(),
            lock: Arc::new(Mutex::new(())),
            shards,
        }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Takes the save lock without waiting.
    pub fn try_begin(&self) -> Option<SaveGuard> {
        let permit = self.lock.clone().try_lock_owned().ok()?;
        Some(SaveGuard {
            _permit: permit,
            dir: self.dir.clone(),
            shards: self.shards,
        })
    }

    /// Waits for any save in flight, then takes the lock.
    pub async fn begin(&self) -> SaveGuard {
        let permit = self.lock.clone().lock_owned().await;
        SaveGuard {
            _permit: permit,
            dir: self.dir.clone(),
            shards: self.shards,
        }
    }

    /// Starts a save, or returns None while another one is running.
    pub fn save(&self, source: &SaveSource<'_>) -> Option<JoinHandle<Result<PathBuf, SaveError>>> {
        match self.try_begin() {
            Some(guard) => Some(guard.write(source)),
            None => {
                tracing::debug!("[save] [skip] a save is already in flight");
                None
            }
        }
    }

    /// The archive with the newest modification time, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>, SaveError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXT) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let is_newer = match &newest {
                None => true,
                Some((t, p)) => (modified, &path) > (*t, p),
            };
            if is_newer {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, p)| p))
    }

    /// Reads the latest archive. No archive at all is `Ok(None)`; anything
    /// wrong with the one found is an error.
    pub fn load(&self) -> Result<Option<LoadedWorld>, SaveError> {
        let _guard = self.try_begin().ok_or(SaveError::Busy)?;
        let Some(path) = self.latest()? else {
            return Ok(None);
        };
        let started = Instant::now();
        tracing::info!("[save] [load] path={}", path.display());

        let bytes = fs::read(&path)?;
        let sections: HashMap<String, Section> = archive::decode_archive(&bytes)?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        let global: GlobalSection = decode(&sections, "global")?;
        let timers: Vec<Timer> = decode(&sections, "timers")?;
        let accounts: Vec<Account> = decode(&sections, "accounts")?;
        let deep: DeepStorage = decode(&sections, "deep-storage")?;
        let mut objects = Vec::new();
        for index in 0..global.shards {
            let shard: Vec<Object> = decode(&sections, &shard_name(index))?;
            objects.extend(shard);
        }
        let map: MapSection = decode(&sections, "map")?;

        tracing::info!(
            "[save] [load] objects={} accounts={} timers={} deep={} elapsed_ms={}",
            objects.len(),
            accounts.len(),
            timers.len(),
            deep.len(),
            started.elapsed().as_millis()
        );

        Ok(Some(LoadedWorld {
            path,
            now: global.now,
            last_mobile: global.last_mobile,
            last_item: global.last_item,
            timers,
            accounts,
            deep,
            objects,
            map: map.meta,
            placements: map.placements,
        }))
    }
}
