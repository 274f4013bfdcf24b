// SQLite document store

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use chrono::NaiveDate;

use cosheet_engine::{CellKind, CellRecord, Coord, DocumentRecord, ErrorKind, Extent, Value};

use crate::{DocumentStore, StoreError, STORE_FORMAT_VERSION};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    rows INTEGER NOT NULL,
    cols INTEGER NOT NULL,
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cells (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    row INTEGER NOT NULL,
    col INTEGER NOT NULL,
    raw_input TEXT NOT NULL,
    kind TEXT NOT NULL,               -- empty, string, number, boolean, date, formula
    version INTEGER NOT NULL,
    cycle_rejected INTEGER NOT NULL DEFAULT 0,
    value_type INTEGER,               -- formula cells only; NULL = evaluate on load
    value_num REAL,
    value_text TEXT,
    PRIMARY KEY (document_id, row, col)
);
"#;

// Format 1 stored raw inputs only
const MIGRATE_FROM_V1: &str = r#"
ALTER TABLE cells ADD COLUMN value_type INTEGER;
ALTER TABLE cells ADD COLUMN value_num REAL;
ALTER TABLE cells ADD COLUMN value_text TEXT;
UPDATE meta SET value = '2' WHERE key = 'format_version';
"#;

// Value type constants
const VALUE_EMPTY: i32 = 0;
const VALUE_NUMBER: i32 = 1;
const VALUE_TEXT: i32 = 2;
const VALUE_BOOLEAN: i32 = 3;
const VALUE_DATE: i32 = 4;
const VALUE_ERROR: i32 = 5;

/// Documents in one SQLite database: a `documents` row per document and a
/// `cells` row per non-empty cell. Formula cells also carry their computed
/// value so a reload shows what sessions last saw.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'format_version'", [], |r| r.get(0))
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('format_version', ?1)",
                    params![STORE_FORMAT_VERSION.to_string()],
                )?;
            }
            Some(v) if v == STORE_FORMAT_VERSION.to_string() => {}
            Some(v) if v == "1" => {
                conn.execute_batch(MIGRATE_FROM_V1)?;
                log::info!("upgraded document database from format 1 to {}", STORE_FORMAT_VERSION);
            }
            Some(v) => {
                return Err(StoreError::Corrupt(format!(
                    "database format version {} (expected {})",
                    v, STORE_FORMAT_VERSION
                )));
            }
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Ids of every stored document, sorted.
    pub fn document_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM documents ORDER BY id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn to_index(value: i64, what: &str) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", what, value)))
}

fn to_version(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative version: {}", value)))
}

fn encode_value(value: &Value) -> (i32, Option<f64>, Option<String>) {
    match value {
        Value::Empty => (VALUE_EMPTY, None, None),
        Value::Number(n) => (VALUE_NUMBER, Some(*n), None),
        Value::Text(s) => (VALUE_TEXT, None, Some(s.clone())),
        Value::Boolean(b) => (VALUE_BOOLEAN, Some(if *b { 1.0 } else { 0.0 }), None),
        Value::Date(d) => (VALUE_DATE, None, Some(d.format("%Y-%m-%d").to_string())),
        Value::Error(e) => (VALUE_ERROR, None, Some(e.code().to_string())),
    }
}

fn decode_value(
    value_type: i32,
    value_num: Option<f64>,
    value_text: Option<String>,
) -> Result<Value, StoreError> {
    let corrupt = || StoreError::Corrupt(format!("bad stored value of type {}", value_type));
    Ok(match value_type {
        VALUE_EMPTY => Value::Empty,
        VALUE_NUMBER => Value::Number(value_num.ok_or_else(corrupt)?),
        VALUE_TEXT => Value::Text(value_text.unwrap_or_default()),
        VALUE_BOOLEAN => Value::Boolean(value_num.ok_or_else(corrupt)? != 0.0),
        VALUE_DATE => {
            let text = value_text.ok_or_else(corrupt)?;
            Value::Date(NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|_| corrupt())?)
        }
        VALUE_ERROR => {
            let code = value_text.ok_or_else(corrupt)?;
            Value::Error(ErrorKind::from_code(&code).ok_or_else(corrupt)?)
        }
        _ => return Err(corrupt()),
    })
}

impl DocumentStore for SqliteStore {
    fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let conn = self.conn.lock();

        let header: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT rows, cols, version FROM documents WHERE id = ?1",
                params![document_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((rows, cols, version)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT row, col, raw_input, kind, version, cycle_rejected,
                    value_type, value_num, value_text
             FROM cells WHERE document_id = ?1 ORDER BY row, col",
        )?;
        let raw_rows = stmt
            .query_map(params![document_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, bool>(5)?,
                    r.get::<_, Option<i32>>(6)?,
                    r.get::<_, Option<f64>>(7)?,
                    r.get::<_, Option<String>>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut cells = Vec::with_capacity(raw_rows.len());
        for row_values in raw_rows {
            let (row, col, raw_input, kind, cell_version, cycle_rejected, value_type, value_num, value_text) =
                row_values;
            let kind = CellKind::from_name(&kind)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown cell kind {:?}", kind)))?;
            let value = match value_type {
                Some(value_type) => Some(decode_value(value_type, value_num, value_text)?),
                None => None,
            };
            cells.push(CellRecord {
                coord: Coord::new(to_index(row, "row")?, to_index(col, "col")?),
                raw_input,
                kind,
                version: to_version(cell_version)?,
                cycle_rejected,
                value,
            });
        }

        Ok(Some(DocumentRecord {
            extent: Extent::new(to_index(rows, "rows")?, to_index(cols, "cols")?),
            version: to_version(version)?,
            cells,
        }))
    }

    fn save_document(&self, document_id: &str, record: &DocumentRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO documents (id, rows, cols, version, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                rows = excluded.rows, cols = excluded.cols,
                version = excluded.version, updated_at = excluded.updated_at",
            params![
                document_id,
                record.extent.rows as i64,
                record.extent.cols as i64,
                record.version as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tx.execute("DELETE FROM cells WHERE document_id = ?1", params![document_id])?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO cells (document_id, row, col, raw_input, kind, version, cycle_rejected,
                                    value_type, value_num, value_text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for cell in &record.cells {
                let (value_type, value_num, value_text) = match &cell.value {
                    Some(value) => {
                        let (t, n, s) = encode_value(value);
                        (Some(t), n, s)
                    }
                    None => (None, None, None),
                };
                stmt.execute(params![
                    document_id,
                    cell.coord.row as i64,
                    cell.coord.col as i64,
                    cell.raw_input,
                    cell.kind.as_str(),
                    cell.version as i64,
                    cell.cycle_rejected,
                    value_type,
                    value_num,
                    value_text,
                ])?;
            }
        }

        tx.commit()?;
        log::debug!(
            "saved document {} (version {}, {} cells)",
            document_id,
            record.version,
            record.cells.len()
        );
        Ok(())
    }
}
