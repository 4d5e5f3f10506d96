//! Segment Index - SQLite-backed store of sources, files and segments
//!
//! One writer connection serializes all mutations of this instance; every
//! mutation that touches a file runs inside one `BEGIN IMMEDIATE`
//! transaction, which also serializes writers in other processes. Readers
//! check out their own connection from a small pool and run each query in a
//! single read transaction, so under WAL they see either the old or the new
//! segment set of a file, never a mix.
//!
//! # Performance
//! - Segment insert: O(log n) per segment
//! - Window query: O(s · log n + k), s = duration scales present for the channel
//! - Pattern expansion: scan of the channels table only

use crate::format::HeaderEntry;
use crate::index::{kscale, kscale_lower_bound, ChannelSegments, IndexStats, RemovedSpan};
use crate::storage::{
    now_tick, ArchiveError, ArchiveResult, ChannelId, ChannelIdentity, ChannelPattern, DataKind, FileId,
    FileRecord, Fingerprint, OffsetHints, Segment, Source, SourceId, SourceSpec, TimeSpan,
    UNREADABLE_FORMAT,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        root TEXT NOT NULL UNIQUE,
        include TEXT,
        exclude TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        format TEXT,
        available INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        path TEXT NOT NULL UNIQUE,
        format TEXT NOT NULL,
        size INTEGER NOT NULL,
        mtime INTEGER NOT NULL,
        hash INTEGER,
        scanned_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_files_source ON files(source_id);

    CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        network TEXT NOT NULL,
        station TEXT NOT NULL,
        location TEXT NOT NULL,
        channel TEXT NOT NULL,
        kscale_mask INTEGER NOT NULL DEFAULT 0,
        UNIQUE (kind, network, station, location, channel)
    );

    CREATE TABLE IF NOT EXISTS segments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        tmin INTEGER NOT NULL,
        tmax INTEGER NOT NULL,
        kscale INTEGER NOT NULL,
        sample_period INTEGER,
        byte_offset INTEGER NOT NULL,
        byte_len INTEGER NOT NULL,
        sample_offset INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_segments_window ON segments(channel_id, kscale, tmin);
    CREATE INDEX IF NOT EXISTS idx_segments_file ON segments(file_id);

    CREATE TABLE IF NOT EXISTS removed_spans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        tmin INTEGER NOT NULL,
        tmax INTEGER NOT NULL,
        removed_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_removed_window ON removed_spans(channel_id, tmin);
    CREATE INDEX IF NOT EXISTS idx_removed_path ON removed_spans(path);

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const SEGMENT_COLUMNS: &str = "
    s.id, s.file_id, f.path, f.format, s.tmin, s.tmax, s.sample_period,
    s.byte_offset, s.byte_len, s.sample_offset,
    f.size, f.mtime, f.hash, f.scanned_at, src.priority";

/// Configuration for the segment index
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Idle reader connections kept open
    pub reader_pool_size: usize,
    /// How long a connection waits on another process' lock
    pub busy_timeout_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            reader_pool_size: 4,
            busy_timeout_ms: 5000,
        }
    }
}

/// SQLite-backed persistent index
pub struct SegmentIndex {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    config: IndexConfig,
}

impl SegmentIndex {
    /// Create or open the index in `data_dir`
    pub fn open(data_dir: &Path) -> ArchiveResult<Self> {
        Self::open_with_config(data_dir, IndexConfig::default())
    }

    /// Create or open with custom configuration
    pub fn open_with_config(data_dir: &Path, config: IndexConfig) -> ArchiveResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("index.sqlite");

        let conn = Self::open_connection(&path, &config, true)?;

        Self::check_integrity(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Self::check_schema_version(&conn)?;

        tracing::debug!("Opened segment index at {:?}", path);

        Ok(Self {
            path,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            config,
        })
    }

    fn open_connection(path: &Path, config: &IndexConfig, create: bool) -> ArchiveResult<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;

        // journal_mode returns a row, so it cannot go through execute_batch
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        if !create {
            conn.execute_batch("PRAGMA query_only = ON;")?;
        }

        Ok(conn)
    }

    fn check_integrity(conn: &Connection) -> ArchiveResult<()> {
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(ArchiveError::IndexCorruption(result));
        }
        Ok(())
    }

    fn check_schema_version(conn: &Connection) -> ArchiveResult<()> {
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(v) if v == SCHEMA_VERSION.to_string() => Ok(()),
            // Version 2 only added removed_spans, which the schema just created
            Some(v) if v == "1" => {
                conn.execute(
                    "UPDATE meta SET value = ? WHERE key = 'schema_version'",
                    params![SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(v) => Err(ArchiveError::IndexCorruption(format!(
                "schema version {} found, expected {}; rebuild the index",
                v, SCHEMA_VERSION
            ))),
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
        }
    }

    fn lock_writer(&self) -> ArchiveResult<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|e| ArchiveError::Lock(format!("Failed to acquire writer lock: {}", e)))
    }

    fn lock_readers(&self) -> ArchiveResult<MutexGuard<'_, Vec<Connection>>> {
        self.readers
            .lock()
            .map_err(|e| ArchiveError::Lock(format!("Failed to acquire reader pool: {}", e)))
    }

    /// Run `f` inside one immediate write transaction
    fn write<T>(&self, f: impl FnOnce(&Connection) -> ArchiveResult<T>) -> ArchiveResult<T> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` inside one read transaction on a pooled reader connection
    fn read<T>(&self, f: impl FnOnce(&Connection) -> ArchiveResult<T>) -> ArchiveResult<T> {
        let pooled = self.lock_readers()?.pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => Self::open_connection(&self.path, &self.config, false)?,
        };

        let result = read_snapshot(&mut conn, f);

        let mut pool = self.lock_readers()?;
        if pool.len() < self.config.reader_pool_size {
            pool.push(conn);
        }

        result
    }

    // ==================== Sources ====================

    /// Register a source, or update the settings of an existing root
    pub fn add_source(&self, spec: &SourceSpec) -> ArchiveResult<SourceId> {
        self.write(|conn| {
            let id = conn.query_row(
                "INSERT INTO sources (root, include, exclude, priority, format, available)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(root) DO UPDATE SET
                     include = excluded.include,
                     exclude = excluded.exclude,
                     priority = excluded.priority,
                     format = excluded.format
                 RETURNING id",
                params![
                    path_key(&spec.root),
                    spec.include,
                    spec.exclude,
                    spec.priority,
                    spec.format
                ],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// All registered sources, ordered by id
    pub fn sources(&self) -> ArchiveResult<Vec<Source>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, root, include, exclude, priority, format, available
                 FROM sources ORDER BY id",
            )?;
            let rows = stmt.query_map([], row_to_source)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Look up a source by root
    pub fn source(&self, root: &Path) -> ArchiveResult<Option<Source>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, root, include, exclude, priority, format, available
                     FROM sources WHERE root = ?",
                    params![path_key(root)],
                    row_to_source,
                )
                .optional()?)
        })
    }

    /// Flag a source as (un)available; unavailable sources are hidden from queries
    pub fn set_source_available(&self, id: SourceId, available: bool) -> ArchiveResult<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE sources SET available = ? WHERE id = ?",
                params![available, id],
            )?;
            Ok(())
        })
    }

    /// Remove a source with all its files and segments
    ///
    /// Returns the paths of the removed files, or None if the root is unknown.
    pub fn remove_source(&self, root: &Path) -> ArchiveResult<Option<Vec<PathBuf>>> {
        self.write(|conn| {
            let id: Option<SourceId> = conn
                .query_row(
                    "SELECT id FROM sources WHERE root = ?",
                    params![path_key(root)],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = id else {
                return Ok(None);
            };

            let files: Vec<(FileId, String)> = {
                let mut stmt = conn.prepare_cached("SELECT id, path FROM files WHERE source_id = ?")?;
                let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            for (file_id, _) in &files {
                delete_segments_tx(conn, *file_id)?;
            }
            conn.execute("DELETE FROM files WHERE source_id = ?", params![id])?;
            conn.execute("DELETE FROM removed_spans WHERE source_id = ?", params![id])?;
            conn.execute("DELETE FROM sources WHERE id = ?", params![id])?;
            conn.execute(
                "DELETE FROM channels
                 WHERE NOT EXISTS (SELECT 1 FROM segments WHERE segments.channel_id = channels.id)
                   AND NOT EXISTS (SELECT 1 FROM removed_spans r WHERE r.channel_id = channels.id)",
                [],
            )?;

            Ok(Some(files.into_iter().map(|(_, p)| PathBuf::from(p)).collect()))
        })
    }

    // ==================== Files ====================

    /// Fingerprints of all files recorded for a source
    pub fn files_for_source(&self, source_id: SourceId) -> ArchiveResult<HashMap<PathBuf, Fingerprint>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT path, size, mtime, hash FROM files WHERE source_id = ?",
            )?;
            let rows = stmt.query_map(params![source_id], |row| {
                Ok((
                    PathBuf::from(row.get::<_, String>(0)?),
                    fingerprint_from_row(row, 1)?,
                ))
            })?;
            Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
        })
    }

    /// Stored fingerprint of a file
    pub fn get_fingerprint(&self, path: &Path) -> ArchiveResult<Option<Fingerprint>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT size, mtime, hash FROM files WHERE path = ?",
                    params![path_key(path)],
                    |row| fingerprint_from_row(row, 0),
                )
                .optional()?)
        })
    }

    /// Stored record of a file
    pub fn get_file(&self, path: &Path) -> ArchiveResult<Option<(FileId, FileRecord)>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, source_id, path, size, mtime, hash, format, scanned_at
                     FROM files WHERE path = ?",
                    params![path_key(path)],
                    |row| {
                        Ok((
                            row.get(0)?,
                            FileRecord {
                                source_id: row.get(1)?,
                                path: PathBuf::from(row.get::<_, String>(2)?),
                                fingerprint: fingerprint_from_row(row, 3)?,
                                format: row.get(6)?,
                                scanned_at: row.get(7)?,
                            },
                        ))
                    },
                )
                .optional()?)
        })
    }

    /// Insert or update a file record without touching its segments
    pub fn upsert_file(&self, record: &FileRecord) -> ArchiveResult<FileId> {
        self.write(|conn| upsert_file_tx(conn, record))
    }

    /// Delete a file record and its segments
    ///
    /// The spans its segments covered are kept as removed spans until a file
    /// appears again at the same path.
    pub fn delete_file(&self, path: &Path) -> ArchiveResult<bool> {
        self.write(|conn| {
            let id: Option<FileId> = conn
                .query_row(
                    "SELECT id FROM files WHERE path = ?",
                    params![path_key(path)],
                    |row| row.get(0),
                )
                .optional()?;

            match id {
                Some(id) => {
                    conn.execute(
                        "INSERT INTO removed_spans (source_id, channel_id, path, tmin, tmax, removed_at)
                         SELECT f.source_id, s.channel_id, f.path, s.tmin, s.tmax, ?2
                         FROM segments s JOIN files f ON f.id = s.file_id
                         WHERE f.id = ?1",
                        params![id, now_tick()],
                    )?;
                    delete_segments_tx(conn, id)?;
                    conn.execute("DELETE FROM files WHERE id = ?", params![id])?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Paths of files that failed to decode on their last scan
    pub fn unreadable_files(&self) -> ArchiveResult<Vec<PathBuf>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT path FROM files WHERE format = ? ORDER BY path")?;
            let rows = stmt.query_map(params![UNREADABLE_FORMAT], |row| row.get::<_, String>(0))?;
            Ok(rows
                .map(|r| r.map(PathBuf::from))
                .collect::<Result<Vec<_>, _>>()?)
        })
    }

    // ==================== Segments ====================

    /// Insert segments for a file
    pub fn insert_segments(&self, file_id: FileId, entries: &[HeaderEntry]) -> ArchiveResult<usize> {
        self.write(|conn| insert_segments_tx(conn, file_id, entries))
    }

    /// Delete all segments of a file
    pub fn delete_segments(&self, file_id: FileId) -> ArchiveResult<usize> {
        self.write(|conn| delete_segments_tx(conn, file_id))
    }

    /// Atomically replace a file record and its whole segment set
    ///
    /// Readers see either the previous segments or the new ones.
    pub fn replace_file(&self, record: &FileRecord, entries: &[HeaderEntry]) -> ArchiveResult<FileId> {
        self.write(|conn| {
            let file_id = upsert_file_tx(conn, record)?;
            conn.execute(
                "DELETE FROM removed_spans WHERE path = ?",
                params![path_key(&record.path)],
            )?;
            delete_segments_tx(conn, file_id)?;
            insert_segments_tx(conn, file_id, entries)?;
            Ok(file_id)
        })
    }

    /// Segments overlapping `window`, ordered by (identity, start)
    pub fn query_segments(&self, pattern: &ChannelPattern, window: TimeSpan) -> ArchiveResult<Vec<Segment>> {
        Ok(self
            .query_channel_segments(pattern, window)?
            .into_iter()
            .flat_map(|c| c.segments)
            .collect())
    }

    /// Segments overlapping `window` grouped per matched identity
    ///
    /// Every identity matching the pattern is returned, including those with
    /// no segment inside the window, together with the removed spans that
    /// overlap it. All lookups share one read snapshot.
    pub fn query_channel_segments(
        &self,
        pattern: &ChannelPattern,
        window: TimeSpan,
    ) -> ArchiveResult<Vec<ChannelSegments>> {
        self.read(|conn| {
            let channels = select_channels(conn, pattern)?;
            let mut out = Vec::with_capacity(channels.len());

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SEGMENT_COLUMNS}
                 FROM segments s
                 JOIN files f ON f.id = s.file_id
                 JOIN sources src ON src.id = f.source_id
                 WHERE s.channel_id = ?1 AND s.kscale = ?2
                   AND s.tmin > ?3 AND s.tmin < ?4 AND s.tmax > ?5
                   AND src.available = 1"
            ))?;
            let mut removed_stmt = conn.prepare_cached(
                "SELECT r.path, r.tmin, r.tmax
                 FROM removed_spans r
                 JOIN sources src ON src.id = r.source_id
                 WHERE r.channel_id = ?1 AND r.tmin < ?2 AND r.tmax > ?3
                   AND src.available = 1
                 ORDER BY r.tmin, r.id",
            )?;

            for channel in channels {
                let mut segments = Vec::new();
                for k in (0..64u32).filter(|k| channel.kscale_mask & (1u64 << k) != 0) {
                    let rows = stmt.query_map(
                        params![
                            channel.id,
                            k,
                            kscale_lower_bound(window.start, k),
                            window.end,
                            window.start
                        ],
                        |row| row_to_segment(row, &channel.identity),
                    )?;
                    for segment in rows {
                        segments.push(segment?);
                    }
                }
                segments.sort_by_key(|s| (s.span.start, s.id));

                let removed = removed_stmt
                    .query_map(params![channel.id, window.end, window.start], |row| {
                        Ok(RemovedSpan {
                            path: PathBuf::from(row.get::<_, String>(0)?),
                            span: TimeSpan {
                                start: row.get(1)?,
                                end: row.get(2)?,
                            },
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                out.push(ChannelSegments {
                    identity: channel.identity,
                    segments,
                    removed,
                });
            }

            Ok(out)
        })
    }

    /// Segments recorded for one file, ordered by id
    pub fn segments_for_file(&self, path: &Path) -> ArchiveResult<Vec<Segment>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SEGMENT_COLUMNS}, c.kind, c.network, c.station, c.location, c.channel
                 FROM segments s
                 JOIN files f ON f.id = s.file_id
                 JOIN sources src ON src.id = f.source_id
                 JOIN channels c ON c.id = s.channel_id
                 WHERE f.path = ?
                 ORDER BY s.id"
            ))?;
            let rows = stmt.query_map(params![path_key(path)], |row| {
                let identity = identity_from_row(row, 15)?;
                row_to_segment(row, &identity)
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Identities matching a pattern, in identity order
    pub fn channels(&self, pattern: &ChannelPattern) -> ArchiveResult<Vec<ChannelIdentity>> {
        self.read(|conn| {
            Ok(select_channels(conn, pattern)?
                .into_iter()
                .map(|c| c.identity)
                .collect())
        })
    }

    /// Overall time span of the segments matching a pattern
    pub fn time_span(&self, pattern: &ChannelPattern) -> ArchiveResult<Option<TimeSpan>> {
        self.read(|conn| {
            let (tmin, tmax): (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT MIN(s.tmin), MAX(s.tmax)
                 FROM segments s
                 JOIN channels c ON c.id = s.channel_id
                 JOIN files f ON f.id = s.file_id
                 JOIN sources src ON src.id = f.source_id
                 WHERE c.kind GLOB ?1 AND c.network GLOB ?2 AND c.station GLOB ?3
                   AND c.location GLOB ?4 AND c.channel GLOB ?5
                   AND src.available = 1",
                params![
                    pattern.kind_glob(),
                    pattern.network,
                    pattern.station,
                    pattern.location,
                    pattern.channel
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            Ok(match (tmin, tmax) {
                (Some(start), Some(end)) => TimeSpan::try_new(start, end),
                _ => None,
            })
        })
    }

    /// Get counts of the index contents
    pub fn stats(&self) -> ArchiveResult<IndexStats> {
        self.read(|conn| {
            let count = |sql: &str| -> ArchiveResult<u64> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(IndexStats {
                sources: count("SELECT COUNT(*) FROM sources")?,
                unavailable_sources: count("SELECT COUNT(*) FROM sources WHERE available = 0")?,
                files: count("SELECT COUNT(*) FROM files")?,
                unreadable_files: count(&format!(
                    "SELECT COUNT(*) FROM files WHERE format = '{}'",
                    UNREADABLE_FORMAT
                ))?,
                channels: count("SELECT COUNT(*) FROM channels")?,
                segments: count("SELECT COUNT(*) FROM segments")?,
            })
        })
    }

    // ==================== Meta ====================

    /// Store a JSON value under `key`
    pub fn set_meta<T: Serialize>(&self, key: &str, value: &T) -> ArchiveResult<()> {
        let json = serde_json::to_string(value)?;
        self.write(|conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, json],
            )?;
            Ok(())
        })
    }

    /// Load the JSON value stored under `key`
    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> ArchiveResult<Option<T>> {
        let json: Option<String> = self.read(|conn| {
            Ok(conn
                .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
                    row.get(0)
                })
                .optional()?)
        })?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Force checkpoint for WAL mode
    pub fn checkpoint(&self) -> ArchiveResult<()> {
        self.lock_writer()?
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_snapshot<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> ArchiveResult<T>,
) -> ArchiveResult<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

/// Paths are stored as text keys
fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

struct ChannelRow {
    id: i64,
    identity: ChannelIdentity,
    kscale_mask: u64,
}

fn select_channels(conn: &Connection, pattern: &ChannelPattern) -> ArchiveResult<Vec<ChannelRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT kind, network, station, location, channel, id, kscale_mask
         FROM channels
         WHERE kind GLOB ?1 AND network GLOB ?2 AND station GLOB ?3
           AND location GLOB ?4 AND channel GLOB ?5",
    )?;

    let rows = stmt.query_map(
        params![
            pattern.kind_glob(),
            pattern.network,
            pattern.station,
            pattern.location,
            pattern.channel
        ],
        |row| {
            Ok(ChannelRow {
                identity: identity_from_row(row, 0)?,
                id: row.get(5)?,
                kscale_mask: row.get::<_, i64>(6)? as u64,
            })
        },
    )?;

    let mut channels = rows.collect::<Result<Vec<_>, _>>()?;
    channels.sort_by(|a, b| a.identity.cmp(&b.identity));
    Ok(channels)
}

fn identity_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<ChannelIdentity> {
    let kind: String = row.get(first)?;
    let kind = kind.parse::<DataKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            first,
            rusqlite::types::Type::Text,
            Box::new(ArchiveError::IndexCorruption(e)),
        )
    })?;

    Ok(ChannelIdentity::new(
        kind,
        ChannelId::new(
            row.get::<_, String>(first + 1)?,
            row.get::<_, String>(first + 2)?,
            row.get::<_, String>(first + 3)?,
            row.get::<_, String>(first + 4)?,
        ),
    ))
}

fn fingerprint_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Fingerprint> {
    Ok(Fingerprint {
        size: row.get::<_, i64>(first)? as u64,
        mtime: row.get(first + 1)?,
        hash: row.get::<_, Option<i64>>(first + 2)?.map(|h| h as u32),
    })
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        spec: SourceSpec {
            root: PathBuf::from(row.get::<_, String>(1)?),
            include: row.get(2)?,
            exclude: row.get(3)?,
            priority: row.get(4)?,
            format: row.get(5)?,
        },
        available: row.get(6)?,
    })
}

fn row_to_segment(row: &Row<'_>, identity: &ChannelIdentity) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: row.get(0)?,
        file_id: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        format: row.get(3)?,
        identity: identity.clone(),
        span: TimeSpan {
            start: row.get(4)?,
            end: row.get(5)?,
        },
        sample_period: row.get(6)?,
        hints: OffsetHints {
            byte_offset: row.get::<_, i64>(7)? as u64,
            byte_len: row.get::<_, i64>(8)? as u64,
            sample_offset: row.get::<_, i64>(9)? as u64,
        },
        fingerprint: fingerprint_from_row(row, 10)?,
        scanned_at: row.get(13)?,
        priority: row.get(14)?,
    })
}

fn upsert_file_tx(conn: &Connection, record: &FileRecord) -> ArchiveResult<FileId> {
    let id = conn.query_row(
        "INSERT INTO files (source_id, path, format, size, mtime, hash, scanned_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(path) DO UPDATE SET
             source_id = excluded.source_id,
             format = excluded.format,
             size = excluded.size,
             mtime = excluded.mtime,
             hash = excluded.hash,
             scanned_at = excluded.scanned_at
         RETURNING id",
        params![
            record.source_id,
            path_key(&record.path),
            record.format,
            record.fingerprint.size as i64,
            record.fingerprint.mtime,
            record.fingerprint.hash.map(|h| h as i64),
            record.scanned_at
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn insert_segments_tx(conn: &Connection, file_id: FileId, entries: &[HeaderEntry]) -> ArchiveResult<usize> {
    let mut channel_stmt = conn.prepare_cached(
        "INSERT INTO channels (kind, network, station, location, channel, kscale_mask)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(kind, network, station, location, channel)
         DO UPDATE SET kscale_mask = kscale_mask | excluded.kscale_mask
         RETURNING id",
    )?;
    let mut segment_stmt = conn.prepare_cached(
        "INSERT INTO segments (file_id, channel_id, tmin, tmax, kscale, sample_period,
                               byte_offset, byte_len, sample_offset)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;

    for entry in entries {
        let k = kscale(entry.span.duration());
        let codes = &entry.identity.codes;
        let channel_id: i64 = channel_stmt.query_row(
            params![
                entry.identity.kind.as_str(),
                codes.network,
                codes.station,
                codes.location,
                codes.channel,
                (1u64 << k) as i64
            ],
            |row| row.get(0),
        )?;

        segment_stmt.execute(params![
            file_id,
            channel_id,
            entry.span.start,
            entry.span.end,
            k,
            entry.sample_period,
            entry.hints.byte_offset as i64,
            entry.hints.byte_len as i64,
            entry.hints.sample_offset as i64
        ])?;
    }

    Ok(entries.len())
}

/// Channels outlive their segments so a vanished file still plans as a gap
fn delete_segments_tx(conn: &Connection, file_id: FileId) -> ArchiveResult<usize> {
    Ok(conn.execute("DELETE FROM segments WHERE file_id = ?", params![file_id])?)
}
