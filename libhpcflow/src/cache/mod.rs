//! Content-addressed cache of pipeline step outputs.
//!
//! Output files are stored as BLOBs in one SQLite file, keyed by a digest of
//! the pipeline's input file, the step ("tool") name and the output file
//! name. The key is independent of any working directory, so a fresh run
//! over byte-identical input finds the earlier outputs, and copying the
//! database file carries the cache to another machine.
//!
//! Cache problems never fail a run: a restore that cannot complete reports
//! a miss, a store that cannot complete is logged and skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::log::*;

pub mod runlog;

/// Hex characters kept from the SHA-256 of the input.
pub const DIGEST_LEN: usize = 16;

const READ_CHUNK: usize = 8192;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS output_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    input_hash TEXT NOT NULL,
    tool TEXT NOT NULL,
    filename TEXT NOT NULL,
    content BLOB NOT NULL,
    size_bytes INTEGER NOT NULL,
    cached_at TEXT NOT NULL,
    UNIQUE(input_hash, tool, filename)
);
CREATE TABLE IF NOT EXISTS run_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL UNIQUE,
    input_hash TEXT NOT NULL,
    workflow_name TEXT NOT NULL,
    input_path TEXT NOT NULL,
    rules_completed INTEGER NOT NULL,
    status TEXT NOT NULL,
    loaded_at TEXT NOT NULL
);
";

/// Tool name to the output paths it produces.
pub type CacheMap = BTreeMap<String, Vec<PathBuf>>;

/// Full lowercase hex SHA-256 of the file's bytes, read in chunks.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .wrap_err_with(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        let read = file
            .read(&mut buffer)
            .wrap_err_with(|| format!("reading {} for hashing", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// First [`DIGEST_LEN`] hex characters of the SHA-256 of the file's bytes.
pub fn content_digest(path: &Path) -> Result<String> {
    let mut digest = sha256_hex(path)?;
    digest.truncate(DIGEST_LEN);
    Ok(digest)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// One cached file, without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub input_hash: String,
    pub tool: String,
    pub filename: String,
    pub size_bytes: u64,
    pub cached_at: String,
}

/// Handle on a cache database file. Every operation opens its own
/// connection, so handles are cheap to clone and share across threads;
/// SQLite's file locking and the per-key uniqueness constraint keep
/// concurrent writers apart.
#[derive(Getters, Debug, Clone)]
pub struct OutputCache {
    path: PathBuf,
}

impl OutputCache {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Open (creating if needed) the database and make sure the schema exists.
    pub(crate) fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("creating cache directory: {}", parent.display()))?;
            }
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .wrap_err_with(|| format!("opening cache database: {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)
            .wrap_err("initializing cache schema")?;
        Ok(conn)
    }

    /// Restore every output of `tool` for `input_file`. Returns true only
    /// when every expected file name is cached and all paths have been
    /// written; otherwise nothing is left on disk and false is returned.
    /// Outputs sharing a file name all receive the one cached blob, and a
    /// tool with no declared outputs is a hit once the database exists.
    pub fn restore(&self, input_file: &Path, tool: &str, outputs: &[PathBuf]) -> bool {
        if !self.path.exists() {
            return false;
        }
        let digest = match content_digest(input_file) {
            Ok(digest) => digest,
            Err(e) => {
                warn!("cannot hash {}: {}", input_file.display(), e);
                return false;
            }
        };
        self.restore_digest(&digest, tool, outputs)
    }

    fn restore_digest(&self, digest: &str, tool: &str, outputs: &[PathBuf]) -> bool {
        match self.try_restore(digest, tool, outputs) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("cache restore for {} failed: {:?}", tool, e);
                false
            }
        }
    }

    fn try_restore(&self, digest: &str, tool: &str, outputs: &[PathBuf]) -> Result<bool> {
        let cached = self.load_blobs(digest, tool)?;

        let expected: BTreeSet<String> = outputs.iter().filter_map(|p| file_name(p)).collect();
        if !expected.iter().all(|name| cached.contains_key(name)) {
            trace!("cache miss for {}: have {:?}", tool, cached.keys().collect::<Vec<_>>());
            return Ok(false);
        }

        let mut written: Vec<&Path> = vec![];
        for path in outputs {
            let blob = file_name(path).and_then(|name| cached.get(&name));
            let result = match blob {
                Some(blob) => write_output(path, blob),
                None => Err(eyre!("no cached content for {}", path.display())),
            };
            if let Err(e) = result {
                for done in written {
                    if let Err(remove) = std::fs::remove_file(done) {
                        debug!("could not remove partial restore {}: {}", done.display(), remove);
                    }
                }
                return Err(e);
            }
            written.push(path.as_path());
            info!("restored from cache: {}", path.display());
        }
        Ok(true)
    }

    fn load_blobs(&self, digest: &str, tool: &str) -> Result<HashMap<String, Vec<u8>>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT filename, content FROM output_cache WHERE input_hash = ?1 AND tool = ?2")?;
        let rows = stmt.query_map(params![digest, tool], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (name, blob) = row?;
            out.insert(name, blob);
        }
        Ok(out)
    }

    /// Upsert every existing output of `tool`. Missing files are skipped.
    /// Returns how many files were stored.
    pub fn store(&self, input_file: &Path, tool: &str, outputs: &[PathBuf]) -> usize {
        let digest = match content_digest(input_file) {
            Ok(digest) => digest,
            Err(e) => {
                warn!("cannot hash {}: {}", input_file.display(), e);
                return 0;
            }
        };
        self.store_digest(&digest, tool, outputs)
    }

    fn store_digest(&self, digest: &str, tool: &str, outputs: &[PathBuf]) -> usize {
        match self.try_store(digest, tool, outputs) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("cache store for {} failed: {:?}", tool, e);
                0
            }
        }
    }

    fn try_store(&self, digest: &str, tool: &str, outputs: &[PathBuf]) -> Result<usize> {
        let mut conn = self.open()?;
        let now = now_rfc3339();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut stored = 0;
        for path in outputs {
            let Some(name) = file_name(path) else {
                continue;
            };
            if !path.is_file() {
                debug!("skipping cache store for missing file: {}", path.display());
                continue;
            }
            let blob = std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?;
            tx.execute(
                "INSERT OR REPLACE INTO output_cache \
                 (input_hash, tool, filename, content, size_bytes, cached_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![digest, tool, name, blob, blob.len() as i64, now],
            )?;
            stored += 1;
        }
        tx.commit()?;
        Ok(stored)
    }

    /// [`OutputCache::restore`] for every tool in `map`, hashing the input
    /// once. Returns hit/miss per tool.
    pub fn restore_all(&self, input_file: &Path, map: &CacheMap) -> BTreeMap<String, bool> {
        let digest = if self.path.exists() {
            content_digest(input_file)
                .map_err(|e| warn!("cannot hash {}: {}", input_file.display(), e))
                .ok()
        } else {
            None
        };
        map.iter()
            .map(|(tool, outputs)| {
                let hit = match &digest {
                    Some(digest) => self.restore_digest(digest, tool, outputs),
                    None => false,
                };
                if hit {
                    info!("cache hit for {}, skipping recomputation", tool);
                } else {
                    info!("cache miss for {}, will compute", tool);
                }
                (tool.clone(), hit)
            })
            .collect()
    }

    /// [`OutputCache::store`] for every tool in `map`. Returns the total
    /// number of files stored.
    pub fn store_all(&self, input_file: &Path, map: &CacheMap) -> usize {
        let digest = match content_digest(input_file) {
            Ok(digest) => digest,
            Err(e) => {
                warn!("cannot hash {}: {}", input_file.display(), e);
                return 0;
            }
        };
        map.iter()
            .map(|(tool, outputs)| {
                let stored = self.store_digest(&digest, tool, outputs);
                info!("cached {} outputs for {}", stored, tool);
                stored
            })
            .sum()
    }

    /// Everything in the cache, without content.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT input_hash, tool, filename, size_bytes, cached_at FROM output_cache \
             ORDER BY input_hash, tool, filename",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CacheEntry {
                input_hash: row.get(0)?,
                tool: row.get(1)?,
                filename: row.get(2)?,
                size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
                cached_at: row.get(4)?,
            })
        })?;
        let mut entries = vec![];
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn write_output(path: &Path, blob: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("creating {}", parent.display()))?;
        }
    }
    std::fs::write(path, blob).wrap_err_with(|| format!("writing {}", path.display()))
}
