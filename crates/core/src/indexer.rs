use crate::db::SqliteSource;
use crate::document::table_mapping;
use crate::error::{IndexError, ScanError};
use crate::es::DocumentStore;
use crate::scan::DirectoryScanner;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct SkippedSource {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Default)]
pub struct IndexReport {
    pub documents_indexed: u64,
    pub databases_indexed: usize,
    pub skipped: Vec<SkippedSource>,
}

/// Index every row of every table of every valid database under the
/// scanner's directory. The index is recreated from scratch; databases that
/// fail midway are reported and skipped rather than aborting the run.
pub async fn index_directory<S>(
    scanner: &DirectoryScanner,
    store: &S,
) -> Result<IndexReport, IndexError>
where
    S: DocumentStore + Sync,
{
    if !scanner.directory().is_dir() {
        return Err(ScanError::NotADirectory(scanner.directory().to_path_buf()).into());
    }

    let paths = scanner.valid_databases();
    store.recreate_index().await?;

    let mut report = IndexReport::default();
    for path in paths {
        match index_database(store, &path).await {
            Ok(count) => {
                report.documents_indexed += count;
                report.databases_indexed += 1;
            }
            Err(error) => report.skipped.push(SkippedSource {
                path,
                reason: error.to_string(),
            }),
        }
    }

    info!(
        directory = %scanner.directory().display(),
        documents = report.documents_indexed,
        databases = report.databases_indexed,
        skipped = report.skipped.len(),
        "indexing finished"
    );
    Ok(report)
}

async fn index_database<S>(store: &S, path: &Path) -> Result<u64, IndexError>
where
    S: DocumentStore + Sync,
{
    let source = SqliteSource::open(path)?;
    let mut indexed = 0u64;

    for table in source.table_names()? {
        let schema = source.table_schema(&table)?;
        store.put_table_mapping(&table_mapping(&schema)).await?;

        let documents = source.read_documents(&table)?;
        if documents.is_empty() {
            continue;
        }
        indexed += store.bulk_index(&documents).await?;
    }

    info!(path = %path.display(), documents = indexed, "database indexed");
    Ok(indexed)
}
