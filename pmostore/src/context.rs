//! Journal de contexte en append-only.
//!
//! Chaque ligne enregistre un évènement daté (UTC et heure locale à la
//! lecture) d'un type donné avec, le plus souvent, le XML du content
//! item concerné. Les planificateurs s'en servent comme boucle de
//! rétroaction : dernier touch input, derniers pageviews, déclencheurs
//! de contenu personnalisé.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::StoreError;

pub const CONTEXT_TYPE_SENSOR_UPDATE: &str = "sensor_update";
pub const CONTEXT_TYPE_TOUCH_INPUT: &str = "touch_input";
pub const CONTEXT_TYPE_PAGEVIEW: &str = "pageview";
pub const CONTEXT_TYPE_CONTENT_TRIGGER: &str = "content_trigger";

/// Les types d'évènement acceptés par [`ContextStore::add_context`].
pub const CONTEXT_TYPES: [&str; 4] = [
    CONTEXT_TYPE_SENSOR_UPDATE,
    CONTEXT_TYPE_TOUCH_INPUT,
    CONTEXT_TYPE_PAGEVIEW,
    CONTEXT_TYPE_CONTENT_TRIGGER,
];

const TABLE: &str = "context_store";

const SQL_CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS context_store (
        context_id INTEGER PRIMARY KEY,
        created DATETIME DEFAULT CURRENT_TIMESTAMP,
        context_type TEXT,
        content_item_xml TEXT
    )
";
const SQL_INSERT: &str =
    "INSERT INTO context_store (context_type, content_item_xml) VALUES (?1, ?2)";
const SQL_SELECT_LATEST_BY_TYPE: &str = "
    SELECT context_type, content_item_xml, created,
           datetime(created, 'localtime') AS created_localtime
    FROM context_store
    WHERE context_type = ?1
    ORDER BY created DESC, context_id DESC
    LIMIT ?2
";
const SQL_SELECT_COUNTS_SINCE: &str = "
    SELECT content_item_xml, count(*) AS num_of_entries
    FROM context_store
    WHERE context_type = ?1 AND created > ?2
    GROUP BY content_item_xml
    ORDER BY num_of_entries ASC
    LIMIT ?3
";

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Une ligne du journal.
#[derive(Debug, Clone)]
pub struct ContextRecord {
    pub context_type: String,
    pub content_item_xml: Option<String>,
    pub created_utc: NaiveDateTime,
    pub created_localtime: NaiveDateTime,
}

/// Accès au journal de contexte.
///
/// SQLite autorise l'accès au fichier par plusieurs processus et
/// threads ; chaque appel ouvre et referme sa propre connexion.
#[derive(Clone)]
pub struct ContextStore {
    db_path: PathBuf,
}

impl ContextStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<ContextStore, StoreError> {
        let store = ContextStore {
            db_path: db_path.as_ref().to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(SQL_CREATE_TABLE)
            .map_err(|e| store.db_err(e))?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open(&self.db_path).map_err(|e| self.db_err(e))
    }

    fn db_err(&self, source: rusqlite::Error) -> StoreError {
        StoreError::Database {
            path: self.db_path.clone(),
            source,
        }
    }

    /// Ajoute un évènement au journal, retourne son identifiant.
    ///
    /// Un `content_item_xml` absent est stocké NULL : l'évènement seul
    /// compte (par exemple un capteur sans payload exploitable).
    pub fn add_context(
        &self,
        context_type: &str,
        content_item_xml: Option<&str>,
    ) -> Result<i64, StoreError> {
        if !CONTEXT_TYPES.contains(&context_type) {
            return Err(StoreError::UnsupportedContextType(context_type.to_string()));
        }

        let conn = self.connect()?;
        conn.execute(SQL_INSERT, params![context_type, content_item_xml])
            .map_err(|e| self.db_err(e))?;
        let row_id = conn.last_insert_rowid();
        debug!(
            "added context information: type '{context_type}' - row id {row_id} (table {TABLE})"
        );
        Ok(row_id)
    }

    /// Les `n` évènements les plus récents d'un type donné, du plus
    /// récent au plus ancien.
    pub fn latest_by_type(
        &self,
        context_type: &str,
        n: usize,
    ) -> Result<Vec<ContextRecord>, StoreError> {
        if !CONTEXT_TYPES.contains(&context_type) {
            return Err(StoreError::UnsupportedContextType(context_type.to_string()));
        }

        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(SQL_SELECT_LATEST_BY_TYPE)
            .map_err(|e| self.db_err(e))?;
        let records = stmt
            .query_map(params![context_type, n as i64], |row| {
                let created: String = row.get(2)?;
                let created_localtime: String = row.get(3)?;
                Ok(ContextRecord {
                    context_type: row.get(0)?,
                    content_item_xml: row.get(1)?,
                    created_utc: parse_datetime(&created),
                    created_localtime: parse_datetime(&created_localtime),
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| self.db_err(e))?;
        Ok(records)
    }

    /// Compte les évènements par content item depuis `since` (UTC),
    /// les moins joués d'abord. Sert à l'allocation par récence.
    pub fn counts_by_item_since(
        &self,
        context_type: &str,
        since: NaiveDateTime,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        if !CONTEXT_TYPES.contains(&context_type) {
            return Err(StoreError::UnsupportedContextType(context_type.to_string()));
        }

        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(SQL_SELECT_COUNTS_SINCE)
            .map_err(|e| self.db_err(e))?;
        let counts = stmt
            .query_map(
                params![
                    context_type,
                    since.format(DATETIME_FORMAT).to_string(),
                    limit as i64
                ],
                |row| {
                    let xml: Option<String> = row.get(0)?;
                    Ok((xml.unwrap_or_default(), row.get(1)?))
                },
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| self.db_err(e))?;
        Ok(counts)
    }
}

fn parse_datetime(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT).unwrap_or_default()
}
