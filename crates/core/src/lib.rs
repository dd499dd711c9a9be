pub mod db;
pub mod document;
pub mod error;
pub mod es;
pub mod indexer;
pub mod scan;

pub use db::{ColumnInfo, SqliteSource};
pub use document::{
    build_document, coerce_value, column_kind, document_id, es_type_for, table_mapping,
    ColumnKind, RowDocument, METADATA_KEY,
};
pub use error::{IndexError, ScanError, SearchError};
pub use es::{DocumentStore, ElasticsearchStore, ScrollCursor, SearchHit};
pub use indexer::{index_directory, IndexReport, SkippedSource};
pub use scan::{discover_sqlite_files, is_sqlite_file, DirectoryScanner, SQLITE_MAGIC};
