use super::*;
use std::collections::BTreeSet;

const TAG_SEPARATOR: char = ',';

/// A reusable prompt in the library, with an optional preview image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptEntry {
    pub id: i64,
    pub title: String,
    pub prompt: String,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(skip)]
    pub image_data: Option<Vec<u8>>,
}

/// Partial change to a library entry; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct PromptEdit {
    pub title: Option<String>,
    pub prompt: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub image_data: Option<Vec<u8>>,
}

impl PromptEntry {
    pub fn apply(&mut self, edit: PromptEdit) {
        if let Some(title) = edit.title {
            self.title = title;
        }
        if let Some(prompt) = edit.prompt {
            self.prompt = prompt;
        }
        if let Some(description) = edit.description {
            self.description = description;
        }
        if let Some(tags) = edit.tags {
            self.tags = tags;
        }
        if let Some(image_data) = edit.image_data {
            self.image_data = Some(image_data);
        }
    }
}

pub(super) fn init_prompts_schema(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            prompt TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '',
            image_data BLOB
        );",
    )?;
    Ok(())
}

fn join_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(TAG_SEPARATOR)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn prompt_from_row(row: &Row<'_>) -> SqlResult<PromptEntry> {
    let tags: String = row.get(4)?;
    Ok(PromptEntry {
        id: row.get(0)?,
        title: row.get(1)?,
        prompt: row.get(2)?,
        description: row.get(3)?,
        tags: split_tags(&tags),
        image_data: row.get(5)?,
    })
}

impl Database {
    // ────────────────────────── Prompt library ──────────────────────────

    /// Stores a new entry and returns its id. `entry.id` is ignored.
    pub fn insert_prompt(&self, entry: &PromptEntry) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO prompts (title, prompt, description, tags, image_data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.title,
                entry.prompt,
                entry.description,
                join_tags(&entry.tags),
                entry.image_data,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Rewrites every field of `entry.id`. Returns `false` for an unknown id.
    pub fn update_prompt(&self, entry: &PromptEntry) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE prompts SET title = ?2, prompt = ?3, description = ?4, tags = ?5, image_data = ?6
             WHERE id = ?1",
            params![
                entry.id,
                entry.title,
                entry.prompt,
                entry.description,
                join_tags(&entry.tags),
                entry.image_data,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Applies `edit` to the stored entry and returns the result, or `None`
    /// for an unknown id.
    pub fn edit_prompt(&self, id: i64, edit: PromptEdit) -> StoreResult<Option<PromptEntry>> {
        let Some(mut entry) = self.get_prompt(id)? else {
            return Ok(None);
        };
        entry.apply(edit);
        if !self.update_prompt(&entry)? {
            return Ok(None);
        }
        Ok(self.get_prompt(id)?)
    }

    pub fn delete_prompt(&self, id: i64) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM prompts WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Duplicates an entry and returns the new id, or `None` if `id` is unknown.
    pub fn copy_prompt(&self, id: i64) -> StoreResult<Option<i64>> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "INSERT INTO prompts (title, prompt, description, tags, image_data)
             SELECT title, prompt, description, tags, image_data FROM prompts WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get_prompt(&self, id: i64) -> StoreResult<Option<PromptEntry>> {
        let conn = self.pool.get()?;
        let result = conn.query_row(
            "SELECT id, title, prompt, description, tags, image_data FROM prompts WHERE id = ?1",
            params![id],
            prompt_from_row,
        );
        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists entries ordered by id. `keyword` is a case-sensitive substring
    /// of title, prompt or description; `tag` must match one tag exactly.
    pub fn list_prompts(
        &self,
        keyword: Option<&str>,
        tag: Option<&str>,
    ) -> StoreResult<Vec<PromptEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, prompt, description, tags, image_data FROM prompts
             WHERE ?1 IS NULL
                OR instr(title, ?1) > 0
                OR instr(prompt, ?1) > 0
                OR instr(description, ?1) > 0
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![keyword], prompt_from_row)?;

        let tag = tag.map(str::trim).filter(|tag| !tag.is_empty());
        let mut entries = Vec::new();
        for row in rows {
            let entry = row?;
            if tag.map_or(true, |wanted| entry.tags.iter().any(|t| t == wanted)) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Every distinct tag used across the library, sorted.
    pub fn prompt_tags(&self) -> StoreResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT tags FROM prompts")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tags = BTreeSet::new();
        for row in rows {
            tags.extend(split_tags(&row?));
        }
        Ok(tags.into_iter().collect())
    }
}
