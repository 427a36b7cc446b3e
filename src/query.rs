//! Query engine: scans the tree and answers subpath, spaces, and search
//! queries.
//!
//! # Scan contract
//!
//! A subpath scan walks the directory tree while it may be changing. It
//! yields entries observed at arbitrary points during the traversal, with
//! no snapshot isolation: documents created or removed mid-scan may or may
//! not appear, and this is never reported as an error. Within one call the
//! order is stable (entries by name, then folders by name); no other sort
//! is applied.
//!
//! # Pagination
//!
//! Filtering and pagination happen in a single pass. Every match counts
//! toward `total`, but a document is only read, projected and enriched if
//! its position among the matches falls inside `[offset, offset + limit)`.
//! `total` is therefore exact without materializing the whole result set.

use globset::{GlobBuilder, GlobMatcher};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::index::SearchIndex;
use crate::models::{
    ContentType, Locator, LocatorsResponse, Meta, Query, QueryResponse, QueryType, Record,
    ResourceType,
};
use crate::resolver::{join_subpath, normalize_subpath, parse_meta_path, PathResolver, META_DIR};
use crate::store::read_meta;

/// Relative to a subpath directory.
const ENTRIES_GLOB: &str = ".meta/*/meta.*";
const FOLDERS_GLOB: &str = "*/.meta/meta.folder.*";
/// Relative to `<subpath>/.meta/<shortname>`.
const ATTACHMENTS_GLOB: &str = "attachments.*/meta.*";
/// Relative to the spaces root.
const SPACES_GLOB: &str = "*/.meta/meta.space.*";

/// A meta document found by a scan, before it is read.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    shortname: String,
    resource_type: ResourceType,
}

/// Counting-while-streaming pagination window.
#[derive(Debug)]
struct Window {
    offset: usize,
    limit: usize,
    total: usize,
}

impl Window {
    fn new(query: &Query) -> Self {
        Self {
            offset: query.offset,
            limit: query.limit,
            total: 0,
        }
    }

    /// Count one match and report whether it belongs on the page, given
    /// how many results are already held.
    fn admit(&mut self, held: usize) -> bool {
        let position = self.total;
        self.total += 1;
        position >= self.offset && held < self.limit
    }
}

pub struct QueryEngine {
    resolver: PathResolver,
    index: Option<SearchIndex>,
    max_limit: usize,
    entries: GlobMatcher,
    folders: GlobMatcher,
    attachments: GlobMatcher,
    spaces: GlobMatcher,
}

impl QueryEngine {
    pub fn new(resolver: PathResolver, index: Option<SearchIndex>, max_limit: usize) -> Self {
        Self {
            resolver,
            index,
            max_limit,
            entries: matcher(ENTRIES_GLOB),
            folders: matcher(FOLDERS_GLOB),
            attachments: matcher(ATTACHMENTS_GLOB),
            spaces: matcher(SPACES_GLOB),
        }
    }

    pub fn from_config(config: &Config, index: Option<SearchIndex>) -> Self {
        Self::new(
            PathResolver::new(&config.storage.spaces_root),
            index,
            config.query.max_limit,
        )
    }

    /// Identity-only listing of a subpath.
    pub fn locators_query(&self, query: &Query) -> Result<LocatorsResponse> {
        query.validate(self.max_limit)?;
        if query.query_type != QueryType::Subpath {
            return Err(StoreError::Validation(
                "locators are only available for subpath queries".into(),
            ));
        }

        let subpath = normalize_subpath(&query.subpath)?;
        let dir = self.resolver.subpath_dir(&query.space_name, &subpath)?;
        let mut window = Window::new(query);
        let mut locators = Vec::new();

        let candidates = self
            .entry_candidates(&dir)?
            .into_iter()
            .chain(self.folder_candidates(&dir)?);
        for candidate in candidates {
            if !query.accepts_type(candidate.resource_type) {
                tracing::debug!(
                    resource_type = %candidate.resource_type,
                    "resource type not listed in filter types"
                );
                continue;
            }
            if !query.accepts_shortname(&candidate.shortname) {
                continue;
            }
            if !window.admit(locators.len()) {
                continue;
            }
            let Some(meta) = read_candidate(&candidate)? else {
                continue;
            };
            locators.push(Locator {
                uuid: meta.uuid,
                space_name: query.space_name.clone(),
                subpath: subpath.clone(),
                shortname: candidate.shortname,
                resource_type: candidate.resource_type,
            });
        }

        Ok(LocatorsResponse {
            total: window.total,
            locators,
        })
    }

    /// Answer a query with enriched records.
    pub async fn serve_query(&self, query: &Query) -> Result<QueryResponse> {
        query.validate(self.max_limit)?;
        match query.query_type {
            QueryType::Spaces => self.spaces_query(query),
            QueryType::Search => self.search_query(query).await,
            QueryType::Subpath => self.subpath_query(query),
        }
    }

    fn spaces_query(&self, query: &Query) -> Result<QueryResponse> {
        let root = self.resolver.root();
        let mut window = Window::new(query);
        let mut records = Vec::new();

        for path in walk_matching(root, 3, &self.spaces, |depth, name| match depth {
            1 => !name.starts_with('.'),
            2 => name == META_DIR,
            _ => true,
        })? {
            let Some(candidate) = self.classify(&path, |t| t == ResourceType::Space) else {
                continue;
            };
            if !query.accepts_shortname(&candidate.shortname) {
                continue;
            }
            if !window.admit(records.len()) {
                continue;
            }
            if let Some(meta) = read_candidate(&candidate)? {
                records.push(meta.to_record("", &query.include_fields));
            }
        }

        Ok(QueryResponse::new(window.total, records))
    }

    async fn search_query(&self, query: &Query) -> Result<QueryResponse> {
        let index = self.index.as_ref().ok_or_else(|| {
            StoreError::Validation("search queries need the search index to be enabled".into())
        })?;
        let (total, hits) = index.search(query).await?;
        let records = hits
            .into_iter()
            .map(|hit| hit.meta.to_record(&hit.subpath, &query.include_fields))
            .collect();
        Ok(QueryResponse::new(total, records))
    }

    fn subpath_query(&self, query: &Query) -> Result<QueryResponse> {
        let subpath = normalize_subpath(&query.subpath)?;
        let dir = self.resolver.subpath_dir(&query.space_name, &subpath)?;
        let mut window = Window::new(query);
        let mut records = Vec::new();

        for candidate in self.entry_candidates(&dir)? {
            if !query.accepts_type(candidate.resource_type) {
                tracing::debug!(
                    resource_type = %candidate.resource_type,
                    "resource type not listed in filter types"
                );
                continue;
            }
            if !query.accepts_shortname(&candidate.shortname) {
                continue;
            }
            let Some(meta) = read_candidate(&candidate)? else {
                continue;
            };
            if !query.accepts_tags(&meta) {
                continue;
            }
            if !window.admit(records.len()) {
                continue;
            }

            let mut record = meta.to_record(&subpath, &query.include_fields);
            if query.retrieve_json_payload {
                self.inline_json_payload(&query.space_name, &subpath, &meta, &mut record)?;
            }
            record.attachments =
                self.attachments_of(&dir, &subpath, &candidate.shortname, query)?;
            records.push(record);
        }

        for candidate in self.folder_candidates(&dir)? {
            if !query.accepts_type(candidate.resource_type) {
                continue;
            }
            if !query.accepts_shortname(&candidate.shortname) {
                continue;
            }
            if !window.admit(records.len()) {
                continue;
            }
            if let Some(meta) = read_candidate(&candidate)? {
                records.push(meta.to_record(&subpath, &query.include_fields));
            }
        }

        Ok(QueryResponse::new(window.total, records))
    }

    fn inline_json_payload(
        &self,
        space: &str,
        subpath: &str,
        meta: &Meta,
        record: &mut Record,
    ) -> Result<()> {
        let Some(payload) = &meta.payload else {
            return Ok(());
        };
        if payload.content_type != ContentType::Json {
            return Ok(());
        }
        let path = self
            .resolver
            .payload_dir(space, subpath, meta.resource_type)?
            .join(&payload.body);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt { path, source: e })?;
        record.attributes.insert("payload".into(), value);
        Ok(())
    }

    /// Attachment records of one entry, grouped by kind in scan order.
    fn attachments_of(
        &self,
        dir: &Path,
        subpath: &str,
        shortname: &str,
        query: &Query,
    ) -> Result<BTreeMap<ResourceType, Vec<Record>>> {
        let parent_dir = dir.join(META_DIR).join(shortname);
        let attachment_subpath = join_subpath(subpath, shortname);
        let mut grouped: BTreeMap<ResourceType, Vec<Record>> = BTreeMap::new();

        for path in walk_matching(&parent_dir, 2, &self.attachments, |depth, name| {
            depth != 1 || name.starts_with("attachments.")
        })? {
            let Some(candidate) = self.classify(&path, |t| t.is_attachment()) else {
                continue;
            };
            if !query.accepts_type(candidate.resource_type) {
                tracing::debug!(
                    resource_type = %candidate.resource_type,
                    "attachment type not listed in filter types"
                );
                continue;
            }
            if let Some(meta) = read_candidate(&candidate)? {
                grouped
                    .entry(candidate.resource_type)
                    .or_default()
                    .push(meta.to_record(&attachment_subpath, &query.include_fields));
            }
        }

        Ok(grouped)
    }

    /// Immediate entries: `<dir>/.meta/<shortname>/meta.<type>.json`.
    fn entry_candidates(&self, dir: &Path) -> Result<Vec<Candidate>> {
        let paths = walk_matching(dir, 3, &self.entries, |depth, name| {
            depth != 1 || name == META_DIR
        })?;
        Ok(paths
            .iter()
            .filter_map(|p| self.classify(p, |t| t.is_entry()))
            .collect())
    }

    /// Immediate child folders: `<dir>/<shortname>/.meta/meta.folder.json`.
    fn folder_candidates(&self, dir: &Path) -> Result<Vec<Candidate>> {
        let paths = walk_matching(dir, 3, &self.folders, |depth, name| match depth {
            1 => !name.starts_with('.'),
            2 => name == META_DIR,
            _ => true,
        })?;
        Ok(paths
            .iter()
            .filter_map(|p| self.classify(p, |t| t == ResourceType::Folder))
            .collect())
    }

    /// Parse a scanned path. Pattern mismatches are logged and skipped so one
    /// malformed sibling never blocks the rest of the listing.
    fn classify(&self, path: &Path, accept: impl Fn(ResourceType) -> bool) -> Option<Candidate> {
        let relative = path.strip_prefix(self.resolver.root()).unwrap_or(path);
        match parse_meta_path(relative) {
            Ok(location) if accept(location.resource_type) => Some(Candidate {
                path: path.to_path_buf(),
                shortname: location.shortname,
                resource_type: location.resource_type,
            }),
            Ok(location) => {
                tracing::warn!(
                    path = %path.display(),
                    resource_type = %location.resource_type,
                    "unexpected resource type at this location, skipping"
                );
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "invalid file pattern, skipping");
                None
            }
        }
    }
}

fn matcher(pattern: &str) -> GlobMatcher {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .unwrap_or_else(|e| panic!("invalid built-in glob '{}': {}", pattern, e))
}

/// Files exactly `depth` levels below `root` whose relative path matches
/// `glob`, in name order. `descend(depth, name)` prunes directories early.
/// A missing root, or entries that vanish during the walk, yield nothing.
fn walk_matching(
    root: &Path,
    depth: usize,
    glob: &GlobMatcher,
    descend: impl Fn(usize, &str) -> bool,
) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let walker = WalkDir::new(root)
        .min_depth(depth)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || e.depth() == depth
                || (e.file_type().is_dir()
                    && descend(e.depth(), &e.file_name().to_string_lossy()))
        });

    let mut paths = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => match err.io_error().map(|e| e.kind()) {
                Some(ErrorKind::NotFound) => continue,
                _ => return Err(err.into_io_error().map(StoreError::Io).unwrap_or_else(
                    || StoreError::Validation("filesystem loop detected during scan".into()),
                )),
            },
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if glob.is_match(relative) {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

/// Read a candidate, treating a file that vanished since the scan as absent.
fn read_candidate(candidate: &Candidate) -> Result<Option<Meta>> {
    match read_meta(&candidate.path, candidate.resource_type) {
        Ok(meta) => Ok(Some(meta)),
        Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
