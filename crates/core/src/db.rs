use crate::document::{build_document, coerce_value, column_kind, document_id, ColumnKind, RowDocument};
use crate::error::ScanError;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Shadow tables created alongside FTS virtual tables.
const FTS_SHADOW_SUFFIXES: &[&str] = &[
    "content", "segments", "segdir", "docsize", "stat", "data", "idx", "config",
];

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

/// Read-only view over a single SQLite database file.
pub struct SqliteSource {
    path: PathBuf,
    connection: Connection,
}

impl SqliteSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), "opening database");
        let connection = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { path, connection })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Integrity check, false for files that carry a valid header but no
    /// readable pages.
    pub fn quick_check(&self) -> bool {
        let result: Result<String, rusqlite::Error> =
            self.connection
                .query_row("PRAGMA quick_check", [], |row| row.get(0));
        matches!(result.as_deref(), Ok("ok"))
    }

    /// User tables, excluding SQLite internals and full-text-search virtual
    /// tables together with their shadow tables.
    pub fn table_names(&self) -> Result<Vec<String>, ScanError> {
        let mut statement = self
            .connection
            .prepare("SELECT name, sql FROM sqlite_master WHERE type = 'table'")?;
        let entries = statement
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;

        Ok(user_tables(&entries))
    }

    /// Column name and declared type for every column of a table.
    pub fn table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>, ScanError> {
        let mut statement = self
            .connection
            .prepare("SELECT name, type FROM pragma_table_info(?1)")?;
        let columns = statement
            .query_map([table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;
        Ok(columns)
    }

    /// All rows of a table as Elasticsearch-ready documents.
    pub fn read_documents(&self, table: &str) -> Result<Vec<RowDocument>, ScanError> {
        let schema = self.table_schema(table)?;
        let kinds: HashMap<String, ColumnKind> = schema
            .iter()
            .map(|column| (column.name.clone(), column_kind(&column.declared_type)))
            .collect();

        let quoted = quote_identifier(table);
        // WITHOUT ROWID tables reject the rowid column; fall back to row order.
        let (sql, has_rowid) = match self
            .connection
            .prepare(&format!("SELECT rowid, * FROM {quoted}"))
        {
            Ok(_) => (format!("SELECT rowid, * FROM {quoted}"), true),
            Err(_) => (format!("SELECT * FROM {quoted}"), false),
        };

        let mut statement = self.connection.prepare(&sql)?;
        let column_names: Vec<String> = statement
            .column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();

        let mut documents = Vec::new();
        let mut rows = statement.query([])?;
        let mut ordinal: i64 = 0;

        while let Some(row) = rows.next()? {
            let row_id = if has_rowid {
                row.get::<_, i64>(0)?
            } else {
                ordinal
            };
            ordinal += 1;

            let skip = usize::from(has_rowid);
            let mut fields = serde_json::Map::new();
            for (position, name) in column_names.iter().enumerate().skip(skip) {
                let kind = kinds.get(name).copied().unwrap_or(ColumnKind::Unspecified);
                if let Some(value) = coerce_value(kind, row.get_ref(position)?) {
                    fields.insert(name.clone(), value);
                }
            }

            let path = self.path.to_string_lossy();
            documents.push(RowDocument {
                id: document_id(&path, table, row_id),
                fields: build_document(&path, table, fields),
            });
        }

        debug!(table, rows = documents.len(), "table read");
        Ok(documents)
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn user_tables(entries: &[(String, Option<String>)]) -> Vec<String> {
    let fts_tables: Vec<&str> = entries
        .iter()
        .filter(|(_, sql)| {
            sql.as_deref()
                .is_some_and(|sql| sql.to_ascii_uppercase().contains("USING FTS"))
        })
        .map(|(name, _)| name.as_str())
        .collect();

    let is_fts_shadow = |name: &str| {
        fts_tables.iter().any(|fts| {
            name.strip_prefix(fts)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|suffix| FTS_SHADOW_SUFFIXES.contains(&suffix))
        })
    };

    let mut names: Vec<String> = entries
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| !name.starts_with("sqlite_"))
        .filter(|name| !fts_tables.contains(name))
        .filter(|name| !is_fts_shadow(name))
        .map(str::to_string)
        .collect();

    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::{user_tables, SqliteSource};
    use rusqlite::Connection;
    use serde_json::json;
    use tempfile::tempdir;

    fn seeded_database(path: &std::path::Path) {
        let connection = Connection::open(path).expect("create test database");
        connection
            .execute_batch(
                "CREATE TABLE messages (id INTEGER, message TEXT);
                 INSERT INTO messages VALUES (1, 'one message');
                 INSERT INTO messages VALUES (2, 'another message');
                 INSERT INTO messages VALUES (3, 'one more message');
                 CREATE TABLE calls (_id INTEGER, number TEXT);
                 INSERT INTO calls VALUES (1, '123456789');",
            )
            .expect("seed test database");
    }

    #[test]
    fn tables_are_listed_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        seeded_database(&path);

        let source = SqliteSource::open(&path)?;
        assert_eq!(source.table_names()?, vec!["calls", "messages"]);
        Ok(())
    }

    #[test]
    fn fts_tables_and_shadows_are_hidden() {
        let entries = vec![
            ("messages".to_string(), Some("CREATE TABLE messages (id INTEGER)".to_string())),
            (
                "messages_search".to_string(),
                Some("CREATE VIRTUAL TABLE messages_search USING fts5(body)".to_string()),
            ),
            ("messages_search_content".to_string(), Some("CREATE TABLE ...".to_string())),
            ("messages_search_docsize".to_string(), Some("CREATE TABLE ...".to_string())),
            ("messages_search_idx".to_string(), Some("CREATE TABLE ...".to_string())),
            ("sqlite_sequence".to_string(), Some("CREATE TABLE ...".to_string())),
        ];

        assert_eq!(user_tables(&entries), vec!["messages"]);
    }

    #[test]
    fn schema_reports_declared_types() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        seeded_database(&path);

        let source = SqliteSource::open(&path)?;
        let schema = source.table_schema("messages")?;
        let columns: Vec<(&str, &str)> = schema
            .iter()
            .map(|column| (column.name.as_str(), column.declared_type.as_str()))
            .collect();
        assert_eq!(columns, vec![("id", "INTEGER"), ("message", "TEXT")]);
        Ok(())
    }

    #[test]
    fn rows_become_documents_with_metadata() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        seeded_database(&path);

        let source = SqliteSource::open(&path)?;
        let documents = source.read_documents("messages")?;
        assert_eq!(documents.len(), 3);

        let first = &documents[0];
        assert_eq!(first.fields.get("id"), Some(&json!(1)));
        assert_eq!(first.fields.get("message"), Some(&json!("one message")));
        assert_eq!(
            first.fields.pointer_field("_metadata", "table"),
            Some("messages")
        );
        assert_eq!(
            first.fields.pointer_field("_metadata", "filename"),
            Some(path.to_string_lossy().as_ref())
        );

        // Identity is stable across reads.
        let again = source.read_documents("messages")?;
        assert_eq!(first.id, again[0].id);
        Ok(())
    }

    #[test]
    fn blob_columns_are_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let connection = Connection::open(&path)?;
        connection.execute_batch(
            "CREATE TABLE pictures (id INTEGER, data BLOB);
             INSERT INTO pictures VALUES (1, x'deadbeef');",
        )?;
        drop(connection);

        let source = SqliteSource::open(&path)?;
        let documents = source.read_documents("pictures")?;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].fields.get("id"), Some(&json!(1)));
        assert!(!documents[0].fields.contains_key("data"));
        Ok(())
    }

    trait PointerField {
        fn pointer_field(&self, object: &str, key: &str) -> Option<&str>;
    }

    impl PointerField for serde_json::Map<String, serde_json::Value> {
        fn pointer_field(&self, object: &str, key: &str) -> Option<&str> {
            self.get(object)?.get(key)?.as_str()
        }
    }
}
