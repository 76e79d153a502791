//! Storage layer for the cost tracker.
//!
//! Persists resource states and their bounded change history using `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! A `Database` can be moved between threads but needs external synchronization
//! (e.g. a `Mutex<Database>`) to be shared.
//!
//! # Schema
//!
//! Timestamps are stored as TEXT in RFC 3339 format with millisecond precision
//! (e.g. `2025-01-15T10:30:00.000Z`), so lexicographic order matches
//! chronological order.
//!
//! History rows are keyed by `(resource_id, seq)`; `seq` starts at 0 for the
//! oldest retained record. Every write replaces the whole history of a
//! resource, so at most [`ct_core::state::HISTORY_LIMIT`] rows exist per
//! resource.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use ct_core::{
    Observation, PriceClassId, ResourceId, ResourceState, StateChangeRecord, ValidationError,
};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use thiserror::Error;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for resource {resource_id}: {timestamp}")]
    TimestampParse {
        resource_id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored identifier failed validation.
    #[error("invalid stored identifier: {0}")]
    InvalidId(#[from] ValidationError),
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// Raw `resources` row before timestamps and IDs are validated.
struct ResourceRow {
    id: String,
    name: String,
    price_class: String,
    current_status: String,
    current_power_state: i32,
    created_at: String,
    last_updated: String,
    last_transition_at: Option<String>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                price_class TEXT NOT NULL,
                current_status TEXT NOT NULL,
                current_power_state INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                last_transition_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_resources_created ON resources(created_at);

            -- Newest records only; seq orders them oldest first.
            CREATE TABLE IF NOT EXISTS resource_history (
                resource_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                status TEXT NOT NULL,
                power_state INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (resource_id, seq),
                FOREIGN KEY (resource_id) REFERENCES resources(id) ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }

    /// Applies one observation, creating the resource on first sight.
    ///
    /// Returns whether a history record was appended. A newly created resource
    /// always counts as appended.
    pub fn record_observation(&mut self, observation: &Observation) -> Result<bool, DbError> {
        let tx = self.conn.transaction()?;
        let (state, appended) = match load_resource(&tx, &observation.id)? {
            Some(mut state) => {
                let appended = state.observe(observation);
                (state, appended)
            }
            None => {
                tracing::info!(resource_id = %observation.id, "tracking new resource");
                (ResourceState::from_observation(observation), true)
            }
        };
        write_resource(&tx, &state)?;
        tx.commit()?;
        Ok(appended)
    }

    /// Stores a full resource state, replacing any existing one.
    pub fn upsert_resource(&mut self, state: &ResourceState) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        write_resource(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetches one resource with its history.
    pub fn get_resource(&self, id: &ResourceId) -> Result<Option<ResourceState>, DbError> {
        load_resource(&self.conn, id)
    }

    /// Loads every tracked resource.
    ///
    /// Reads happen inside one transaction so the snapshot is consistent.
    pub fn load_snapshot(&mut self) -> Result<HashMap<ResourceId, ResourceState>, DbError> {
        let tx = self.conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare(
                "
                SELECT id, name, price_class, current_status, current_power_state,
                       created_at, last_updated, last_transition_at
                FROM resources
                ORDER BY id ASC
                ",
            )?;
            let rows = stmt.query_map([], read_resource_row)?;
            let mut collected = Vec::new();
            for row in rows {
                collected.push(row?);
            }
            collected
        };

        let mut history = load_all_history(&tx)?;
        let mut snapshot = HashMap::with_capacity(rows.len());
        for row in rows {
            let records = history.remove(&row.id).unwrap_or_default();
            let state = build_state(row, records)?;
            snapshot.insert(state.id.clone(), state);
        }
        tx.commit()?;

        tracing::debug!(resources = snapshot.len(), "loaded resource snapshot");
        Ok(snapshot)
    }
}

fn read_resource_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceRow> {
    Ok(ResourceRow {
        id: row.get(0)?,
        name: row.get(1)?,
        price_class: row.get(2)?,
        current_status: row.get(3)?,
        current_power_state: row.get(4)?,
        created_at: row.get(5)?,
        last_updated: row.get(6)?,
        last_transition_at: row.get(7)?,
    })
}

fn load_resource(conn: &Connection, id: &ResourceId) -> Result<Option<ResourceState>, DbError> {
    let row = conn
        .query_row(
            "
            SELECT id, name, price_class, current_status, current_power_state,
                   created_at, last_updated, last_transition_at
            FROM resources
            WHERE id = ?
            ",
            [id.as_str()],
            read_resource_row,
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "
        SELECT status, power_state, timestamp
        FROM resource_history
        WHERE resource_id = ?
        ORDER BY seq ASC
        ",
    )?;
    let rows = stmt.query_map([id.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i32>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut records = Vec::new();
    for row in rows {
        let (status, power_state, timestamp) = row?;
        records.push(StateChangeRecord {
            status,
            power_state,
            timestamp: parse_timestamp(&timestamp, id.as_str())?,
        });
    }

    build_state(row, records).map(Some)
}

fn load_all_history(
    conn: &Connection,
) -> Result<HashMap<String, Vec<StateChangeRecord>>, DbError> {
    let mut stmt = conn.prepare(
        "
        SELECT resource_id, status, power_state, timestamp
        FROM resource_history
        ORDER BY resource_id ASC, seq ASC
        ",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i32>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut history: HashMap<String, Vec<StateChangeRecord>> = HashMap::new();
    for row in rows {
        let (resource_id, status, power_state, timestamp) = row?;
        let timestamp = parse_timestamp(&timestamp, &resource_id)?;
        history.entry(resource_id).or_default().push(StateChangeRecord {
            status,
            power_state,
            timestamp,
        });
    }
    Ok(history)
}

fn build_state(
    row: ResourceRow,
    records: Vec<StateChangeRecord>,
) -> Result<ResourceState, DbError> {
    let created_at = parse_timestamp(&row.created_at, &row.id)?;
    let last_updated = parse_timestamp(&row.last_updated, &row.id)?;
    let last_transition_at = row
        .last_transition_at
        .as_deref()
        .map(|timestamp| parse_timestamp(timestamp, &row.id))
        .transpose()?;

    let mut state = ResourceState::from_observation(&Observation {
        id: ResourceId::new(row.id)?,
        name: row.name,
        price_class: PriceClassId::new(row.price_class)?,
        status: row.current_status,
        power_state: row.current_power_state,
        created_at,
        observed_at: last_updated,
        changed_at: last_transition_at,
    });
    state.replace_history(records);
    Ok(state)
}

fn write_resource(tx: &Transaction<'_>, state: &ResourceState) -> Result<(), DbError> {
    tx.execute(
        "
        INSERT INTO resources
        (id, name, price_class, current_status, current_power_state,
         created_at, last_updated, last_transition_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            price_class = excluded.price_class,
            current_status = excluded.current_status,
            current_power_state = excluded.current_power_state,
            created_at = excluded.created_at,
            last_updated = excluded.last_updated,
            last_transition_at = excluded.last_transition_at
        ",
        params![
            state.id.as_str(),
            state.name,
            state.price_class.as_str(),
            state.current_status,
            state.current_power_state,
            format_timestamp(state.created_at),
            format_timestamp(state.last_updated),
            state.last_transition_at.map(format_timestamp),
        ],
    )?;

    tx.execute(
        "DELETE FROM resource_history WHERE resource_id = ?",
        [state.id.as_str()],
    )?;
    let mut stmt = tx.prepare(
        "
        INSERT INTO resource_history (resource_id, seq, status, power_state, timestamp)
        VALUES (?, ?, ?, ?, ?)
        ",
    )?;
    for (seq, record) in (0_i64..).zip(state.history()) {
        stmt.execute(params![
            state.id.as_str(),
            seq,
            record.status,
            record.power_state,
            format_timestamp(record.timestamp),
        ])?;
    }
    Ok(())
}

fn parse_timestamp(timestamp: &str, resource_id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            resource_id: resource_id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
