use crate::error::StoreError;
use crate::parser::GenerationAttributes;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

mod prompts;

pub use prompts::{PromptEdit, PromptEntry};

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe store wrapper backed by an r2d2 connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
const DB_POOL_SIZE: u32 = 4;
const CONNECT_BACKOFF_MS: u64 = 100;
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

const RECORD_COLUMNS: &str = "id, directory_path, file_name, extension, software, prompt,
     negative_prompt, description, thumbnail, nsfw_flag, fav_flag, trash_flag, rating,
     created_at, updated_at";

fn apply_connection_pragmas(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys=ON;
         PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA temp_store=MEMORY;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One stored row of `image_attributes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttributeRecord {
    pub id: i64,
    pub directory_path: String,
    pub file_name: String,
    pub extension: String,
    pub software: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub description: String,
    #[serde(skip)]
    pub thumbnail: Vec<u8>,
    pub nsfw_flag: bool,
    pub fav_flag: bool,
    pub trash_flag: bool,
    pub rating: i64,
    /// Unix milliseconds of the first insert.
    pub created_at: i64,
    /// Unix milliseconds of the last successful extraction.
    pub updated_at: i64,
}

impl ImageAttributeRecord {
    pub fn attributes(&self) -> GenerationAttributes {
        GenerationAttributes {
            software: self.software.clone(),
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            description: self.description.clone(),
        }
    }
}

/// Everything an upsert writes. Timestamps are owned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewImageAttributes {
    pub directory_path: String,
    pub file_name: String,
    pub extension: String,
    pub attributes: GenerationAttributes,
    pub thumbnail: Vec<u8>,
    pub nsfw_flag: bool,
    pub fav_flag: bool,
    pub trash_flag: bool,
    pub rating: i64,
}

/// One entry of the prompt word list, e.g. `1girl (12)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordCount {
    pub word: String,
    pub count: usize,
}

/// Splits each prompt on `delimiter` after removing emphasis brackets and
/// tallies the trimmed, non-empty words. Sorted by word.
pub fn count_prompt_words<'a, I>(prompts: I, delimiter: &str) -> Vec<WordCount>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for prompt in prompts {
        let stripped: String = prompt
            .chars()
            .filter(|c| !matches!(c, '{' | '}' | '[' | ']'))
            .collect();
        let words: Vec<&str> = if delimiter.is_empty() {
            vec![stripped.as_str()]
        } else {
            stripped.split(delimiter).collect()
        };
        for word in words.into_iter().map(str::trim).filter(|w| !w.is_empty()) {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .map(|(word, count)| WordCount { word, count })
        .collect()
}

/// User-editable boolean columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFlag {
    Nsfw,
    Favorite,
    Trash,
}

impl ImageFlag {
    fn column(self) -> &'static str {
        match self {
            ImageFlag::Nsfw => "nsfw_flag",
            ImageFlag::Favorite => "fav_flag",
            ImageFlag::Trash => "trash_flag",
        }
    }
}

impl Database {
    /// Opens or creates the store at `db_path`, retrying up to
    /// `connect_attempts` times before giving up with
    /// [`StoreError::Unavailable`].
    pub fn open(db_path: &Path, connect_attempts: u32) -> StoreResult<Self> {
        let attempts = connect_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            match Self::connect(db_path) {
                Ok(db) => return Ok(db),
                Err(reason) => {
                    log::warn!(
                        "store open attempt {}/{} for {} failed: {}",
                        attempt,
                        attempts,
                        db_path.display(),
                        reason
                    );
                    last_reason = reason;
                }
            }
            if attempt < attempts {
                std::thread::sleep(Duration::from_millis(CONNECT_BACKOFF_MS * attempt as u64));
            }
        }

        Err(StoreError::Unavailable {
            path: db_path.display().to_string(),
            attempts,
            reason: last_reason,
        })
    }

    fn connect(db_path: &Path) -> Result<Self, String> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }

        let manager =
            SqliteConnectionManager::file(db_path).with_init(|conn| apply_connection_pragmas(conn));
        let pool = Pool::builder()
            .max_size(DB_POOL_SIZE)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .build(manager)
            .map_err(|err| err.to_string())?;

        let db = Database { pool };
        db.init_schema().map_err(|err| err.to_string())?;
        Ok(db)
    }

    /// Creates both tables and the identity index.
    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.pool.get()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS image_attributes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                directory_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                extension TEXT NOT NULL DEFAULT '',
                software TEXT NOT NULL DEFAULT '',
                prompt TEXT NOT NULL DEFAULT '',
                negative_prompt TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                thumbnail BLOB NOT NULL DEFAULT x'',
                nsfw_flag INTEGER NOT NULL DEFAULT 0,
                fav_flag INTEGER NOT NULL DEFAULT 0,
                trash_flag INTEGER NOT NULL DEFAULT 0,
                rating INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;

        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_image_attributes_identity
                ON image_attributes(directory_path, file_name);",
        )?;

        prompts::init_prompts_schema(&conn)?;
        Ok(())
    }

    // ────────────────────────────── Writes ──────────────────────────────

    /// Insert-or-replace by identity. Every field is overwritten except
    /// `created_at`; `updated_at` is stamped here and always advances.
    pub fn upsert_attributes(&self, record: &NewImageAttributes) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        let attrs = &record.attributes;
        let id = conn.query_row(
            "INSERT INTO image_attributes
                (directory_path, file_name, extension, software, prompt, negative_prompt,
                 description, thumbnail, nsfw_flag, fav_flag, trash_flag, rating,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT(directory_path, file_name) DO UPDATE SET
                 extension=excluded.extension,
                 software=excluded.software,
                 prompt=excluded.prompt,
                 negative_prompt=excluded.negative_prompt,
                 description=excluded.description,
                 thumbnail=excluded.thumbnail,
                 nsfw_flag=excluded.nsfw_flag,
                 fav_flag=excluded.fav_flag,
                 trash_flag=excluded.trash_flag,
                 rating=excluded.rating,
                 updated_at=MAX(excluded.updated_at, image_attributes.updated_at + 1)
             RETURNING id",
            params![
                record.directory_path,
                record.file_name,
                record.extension,
                attrs.software,
                attrs.prompt,
                attrs.negative_prompt,
                attrs.description,
                record.thumbnail,
                record.nsfw_flag,
                record.fav_flag,
                record.trash_flag,
                record.rating,
                now_millis(),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Flips one flag and returns its new value, or `None` for an unknown id.
    /// `updated_at` is left alone so it keeps tracking the last extraction.
    pub fn toggle_flag(&self, id: i64, flag: ImageFlag) -> StoreResult<Option<bool>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let column = flag.column();
        let result = tx.query_row(
            &format!(
                "UPDATE image_attributes SET {column} = 1 - {column} WHERE id = ?1 RETURNING {column}"
            ),
            params![id],
            |row| row.get::<_, bool>(0),
        );
        let value = match result {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => return Err(err.into()),
        };
        tx.commit()?;
        Ok(value)
    }

    /// Returns `false` when no row has this id.
    pub fn set_rating(&self, id: i64, rating: i64) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE image_attributes SET rating = ?2 WHERE id = ?1",
            params![id, rating],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_image(&self, id: i64) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM image_attributes WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // ────────────────────────────── Reads ──────────────────────────────

    pub fn get_by_identity(
        &self,
        directory_path: &str,
        file_name: &str,
    ) -> StoreResult<Option<ImageAttributeRecord>> {
        let conn = self.pool.get()?;
        let result = conn.query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM image_attributes
                 WHERE directory_path = ?1 AND file_name = ?2"
            ),
            params![directory_path, file_name],
            record_from_row,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_by_id(&self, id: i64) -> StoreResult<Option<ImageAttributeRecord>> {
        let conn = self.pool.get()?;
        let result = conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM image_attributes WHERE id = ?1"),
            params![id],
            record_from_row,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// All records, or those whose prompt or negative prompt contains
    /// `filter` (case-sensitive substring). Ordered by id.
    pub fn list_attributes(&self, filter: Option<&str>) -> StoreResult<Vec<ImageAttributeRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM image_attributes
             WHERE ?1 IS NULL OR instr(prompt, ?1) > 0 OR instr(negative_prompt, ?1) > 0
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![filter], record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn list_in_directory(&self, directory_path: &str) -> StoreResult<Vec<ImageAttributeRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM image_attributes
             WHERE directory_path = ?1
             ORDER BY file_name ASC"
        ))?;
        let rows = stmt.query_map(params![directory_path], record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Fetches `file_name -> updated_at` for one directory in a single query,
    /// so change detection needs no per-file round trip.
    pub fn updated_at_by_directory(&self, directory_path: &str) -> StoreResult<HashMap<String, i64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT file_name, updated_at FROM image_attributes WHERE directory_path = ?1",
        )?;
        let rows = stmt.query_map(params![directory_path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (file_name, updated_at) = row?;
            map.insert(file_name, updated_at);
        }
        Ok(map)
    }

    /// Word list over the prompts of the records [`list_attributes`] would
    /// return for `filter`, limited to `root` and its subdirectories when
    /// given.
    ///
    /// [`list_attributes`]: Database::list_attributes
    pub fn prompt_word_counts(
        &self,
        root: Option<&str>,
        filter: Option<&str>,
        delimiter: &str,
    ) -> StoreResult<Vec<WordCount>> {
        let root = root.map(|root| root.trim_end_matches('/')).filter(|r| !r.is_empty());
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT prompt FROM image_attributes
             WHERE (?1 IS NULL OR directory_path = ?1
                    OR substr(directory_path, 1, length(?1) + 1) = ?1 || '/')
               AND (?2 IS NULL OR instr(prompt, ?2) > 0 OR instr(negative_prompt, ?2) > 0)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![root, filter], |row| row.get::<_, String>(0))?;

        let mut prompts = Vec::new();
        for row in rows {
            prompts.push(row?);
        }
        Ok(count_prompt_words(prompts.iter().map(String::as_str), delimiter))
    }

    pub fn count(&self) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row("SELECT COUNT(*) FROM image_attributes", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn record_from_row(row: &Row<'_>) -> SqlResult<ImageAttributeRecord> {
    Ok(ImageAttributeRecord {
        id: row.get(0)?,
        directory_path: row.get(1)?,
        file_name: row.get(2)?,
        extension: row.get(3)?,
        software: row.get(4)?,
        prompt: row.get(5)?,
        negative_prompt: row.get(6)?,
        description: row.get(7)?,
        thumbnail: row.get(8)?,
        nsfw_flag: row.get(9)?,
        fav_flag: row.get(10)?,
        trash_flag: row.get(11)?,
        rating: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
