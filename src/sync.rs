//! Full re-index of the tree into the search index.
//!
//! Walks every space under the spaces root, recovers each meta document's
//! identity from its path, and upserts it. Used after a rebuild, or to
//! repair an index left stale by a crash between a write and its sync.

use walkdir::WalkDir;

use crate::error::{Result, StoreError};
use crate::index::SearchIndex;
use crate::resolver::parse_meta_path;
use crate::store::MetadataStore;

/// Counts reported by [`reindex`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexStats {
    pub indexed: usize,
    pub skipped: usize,
}

/// Drop the index and repopulate it from the tree.
pub async fn reindex(store: &MetadataStore, index: &SearchIndex) -> Result<ReindexStats> {
    index.rebuild().await?;

    let root = store.resolver().root();
    let mut stats = ReindexStats::default();
    if !root.is_dir() {
        return Ok(stats);
    }

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            e.into_io_error().map(StoreError::Io).unwrap_or_else(|| {
                StoreError::Validation("filesystem loop detected during reindex".into())
            })
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.starts_with("meta.") {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let location = match parse_meta_path(relative) {
            Ok(location) => location,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unindexable file");
                stats.skipped += 1;
                continue;
            }
        };

        let meta = store.load(
            &location.space,
            &location.subpath,
            &location.shortname,
            location.resource_type,
        )?;
        index
            .upsert(&location.space, &location.subpath, &meta)
            .await?;
        stats.indexed += 1;
    }

    tracing::info!(
        indexed = stats.indexed,
        skipped = stats.skipped,
        "reindex complete"
    );
    Ok(stats)
}
