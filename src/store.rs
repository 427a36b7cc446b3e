//! Metadata store: create, read, update, move and delete meta documents.
//!
//! The store owns every mutation of the tree. All paths come from the
//! [`PathResolver`]; the store itself only sequences filesystem calls.
//!
//! Operations are blocking and take no locks. Two writers racing on the
//! same meta path are not serialized: the last write wins and readers may
//! observe intermediate states. `create` is the exception in that it uses
//! an exclusive open, so of two concurrent creates exactly one succeeds.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::models::{Meta, ResourceType};
use crate::resolver::{normalize_subpath, validate_name, PathResolver};

/// File-backed store rooted at the spaces directory.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    resolver: PathResolver,
    chunk_size: usize,
}

impl MetadataStore {
    pub fn new(resolver: PathResolver, chunk_size: usize) -> Self {
        Self {
            resolver,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            PathResolver::new(&config.storage.spaces_root),
            config.storage.payload_chunk_size,
        )
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Load the document stored under `(space, subpath, shortname, kind)`.
    pub fn load(
        &self,
        space: &str,
        subpath: &str,
        shortname: &str,
        kind: ResourceType,
    ) -> Result<Meta> {
        let path = self.resolver.meta_file(space, subpath, shortname, kind)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(format!(
                "{} '{}' in {}/{}",
                kind, shortname, space, subpath
            )));
        }
        read_meta(&path, kind)
    }

    /// Write a new document. Fails with `Conflict` if one is already there.
    pub fn create(&self, space: &str, subpath: &str, meta: &Meta) -> Result<()> {
        let (dir, filename) =
            self.resolver
                .metapath(space, subpath, &meta.shortname, meta.resource_type)?;
        fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&filename))
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::Conflict(format!(
                    "{} '{}' in {}/{}",
                    meta.resource_type, meta.shortname, space, subpath
                )),
                _ => StoreError::Io(e),
            })?;
        write_meta_to(file, meta)?;

        tracing::info!(
            space,
            subpath,
            shortname = %meta.shortname,
            resource_type = %meta.resource_type,
            "created"
        );
        Ok(())
    }

    /// Create the marker document that makes `space` a space.
    pub fn create_space(&self, meta: &Meta) -> Result<()> {
        if meta.resource_type != ResourceType::Space {
            return Err(StoreError::Validation(format!(
                "space marker must have resource type 'space', got '{}'",
                meta.resource_type
            )));
        }
        self.create(&meta.shortname, "", meta)
    }

    /// Replace an existing document in full.
    pub fn update(&self, space: &str, subpath: &str, meta: &Meta) -> Result<()> {
        let path = self
            .resolver
            .meta_file(space, subpath, &meta.shortname, meta.resource_type)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(format!(
                "{} '{}' in {}/{}",
                meta.resource_type, meta.shortname, space, subpath
            )));
        }
        write_meta(&path, meta)?;
        tracing::info!(space, subpath, shortname = %meta.shortname, "updated");
        Ok(())
    }

    /// Stream a binary payload to `<shortname>.<ext of uploaded_name>`.
    ///
    /// The meta document must already exist. The input is copied through a
    /// fixed buffer of `payload_chunk_size` bytes, so memory use does not
    /// depend on the payload size. Returns the payload filename.
    pub fn save_payload<R: Read>(
        &self,
        space: &str,
        subpath: &str,
        meta: &Meta,
        uploaded_name: &str,
        mut reader: R,
    ) -> Result<String> {
        let dir = self.payload_target(space, subpath, meta)?;
        let filename = match Path::new(uploaded_name).extension() {
            Some(ext) => format!("{}.{}", meta.shortname, ext.to_string_lossy()),
            None => meta.shortname.clone(),
        };

        let mut file = File::create(dir.join(&filename))?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(&buf[..n])?;
            written += n as u64;
        }
        file.flush()?;

        tracing::info!(space, subpath, payload = %filename, bytes = written, "payload saved");
        Ok(filename)
    }

    /// Write a structured payload as `<shortname>.json`.
    pub fn save_payload_from_json(
        &self,
        space: &str,
        subpath: &str,
        meta: &Meta,
        data: &Value,
    ) -> Result<String> {
        let dir = self.payload_target(space, subpath, meta)?;
        let filename = format!("{}.json", meta.shortname);
        let body = serde_json::to_vec(data).map_err(|e| StoreError::Corrupt {
            path: dir.join(&filename),
            source: e,
        })?;
        fs::write(dir.join(&filename), body)?;

        tracing::info!(space, subpath, payload = %filename, "json payload saved");
        Ok(filename)
    }

    fn payload_target(&self, space: &str, subpath: &str, meta: &Meta) -> Result<PathBuf> {
        let meta_path =
            self.resolver
                .meta_file(space, subpath, &meta.shortname, meta.resource_type)?;
        if !meta_path.is_file() {
            return Err(StoreError::NotFound(format!(
                "metadata is missing for {} '{}' in {}/{}",
                meta.resource_type, meta.shortname, space, subpath
            )));
        }
        let dir = self.resolver.payload_dir(space, subpath, meta.resource_type)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Move and/or rename a document.
    ///
    /// Attachments are single files, so the meta file itself is renamed;
    /// media attachments also carry their payload files along. Folders move
    /// as whole directories. Entries move their meta file, and their
    /// attachments unless another entry still shares the shortname at the
    /// source. `meta` is updated in place with
    /// the new shortname and payload body, and persisted at the destination
    /// whenever it changed.
    pub fn move_entry(
        &self,
        space: &str,
        src_subpath: &str,
        src_shortname: &str,
        dst_subpath: Option<&str>,
        dst_shortname: Option<&str>,
        meta: &mut Meta,
    ) -> Result<()> {
        let kind = meta.resource_type;
        if kind == ResourceType::Space {
            return Err(StoreError::Validation("spaces cannot be moved".into()));
        }

        let dst_subpath_value = dst_subpath.unwrap_or(src_subpath);
        let dst_shortname_value = dst_shortname.unwrap_or(src_shortname);
        validate_name(dst_shortname_value, "shortname")?;

        let (src_dir, src_file) = self
            .resolver
            .metapath(space, src_subpath, src_shortname, kind)?;
        let (dst_dir, dst_file) =
            self.resolver
                .metapath(space, dst_subpath_value, dst_shortname_value, kind)?;

        if !src_dir.join(&src_file).is_file() {
            return Err(StoreError::NotFound(format!(
                "{} '{}' in {}/{}",
                kind, src_shortname, space, src_subpath
            )));
        }
        if src_dir.join(&src_file) == dst_dir.join(&dst_file) {
            return Ok(());
        }
        if dst_dir.join(&dst_file).exists() {
            return Err(StoreError::Conflict(format!(
                "{} '{}' in {}/{}",
                kind, dst_shortname_value, space, dst_subpath_value
            )));
        }

        let mut mutated = false;
        if kind.is_attachment() {
            fs::create_dir_all(&dst_dir)?;
            fs::rename(src_dir.join(&src_file), dst_dir.join(&dst_file))?;
            if kind == ResourceType::Media {
                mutated |= relocate_sibling_payloads(
                    &src_dir,
                    &dst_dir,
                    src_shortname,
                    dst_shortname_value,
                    meta,
                )?;
            }
        } else if kind == ResourceType::Folder {
            // The folder node is the parent of its `.meta` directory.
            match (src_dir.parent(), dst_dir.parent()) {
                (Some(src_node), Some(dst_node)) => rename_dir(src_node, dst_node)?,
                _ => return Err(StoreError::Validation("folder has no parent node".into())),
            }
        } else {
            let payload_move = self.plan_payload_move(
                space,
                src_subpath,
                dst_subpath_value,
                dst_shortname_value,
                meta,
            )?;
            move_entry_files(&src_dir, &dst_dir, &src_file)?;
            if let Some((from, to, body)) = payload_move {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&from, &to)?;
                if let Some(payload) = meta.payload.as_mut() {
                    payload.body = body;
                }
                mutated = true;
            }
        }

        if let Some(name) = dst_shortname {
            meta.shortname = name.to_string();
            mutated = true;
        }

        if mutated {
            write_meta(&dst_dir.join(&dst_file), meta)?;
        }

        let space_dir = self.resolver.space_dir(space)?;
        let src_prune_from = if kind == ResourceType::Folder {
            src_dir.parent().map(Path::to_path_buf).unwrap_or(src_dir)
        } else {
            src_dir
        };
        prune_empty_dirs(&src_prune_from, &space_dir)?;

        tracing::info!(
            space,
            from = %format!("{}/{}", src_subpath, src_shortname),
            to = %format!("{}/{}", dst_subpath_value, dst_shortname_value),
            resource_type = %kind,
            "moved"
        );
        Ok(())
    }

    /// Entry payloads live in the subpath directory, outside the entry's
    /// `.meta/<shortname>` directory, so they follow the move separately.
    /// Returns `(from, to, new body)`, or `None` when nothing has to move.
    /// Runs before anything on disk is changed.
    fn plan_payload_move(
        &self,
        space: &str,
        src_subpath: &str,
        dst_subpath: &str,
        dst_shortname: &str,
        meta: &Meta,
    ) -> Result<Option<(PathBuf, PathBuf, String)>> {
        let Some(payload) = meta.payload.as_ref() else {
            return Ok(None);
        };
        let src_path = self
            .resolver
            .payload_dir(space, src_subpath, meta.resource_type)?
            .join(&payload.body);
        if !src_path.is_file() {
            return Ok(None);
        }

        let renamed = renamed_with_extension(&src_path, dst_shortname);
        let dst_path = self
            .resolver
            .payload_dir(space, dst_subpath, meta.resource_type)?
            .join(&renamed);
        if dst_path == src_path {
            return Ok(None);
        }
        if dst_path.exists() {
            return Err(StoreError::Conflict(format!(
                "payload destination exists: {}",
                dst_path.display()
            )));
        }
        Ok(Some((src_path, dst_path, renamed)))
    }

    /// Remove a document, its payload files, and any directories left empty.
    pub fn delete(&self, space: &str, subpath: &str, meta: &Meta) -> Result<()> {
        let kind = meta.resource_type;
        let (dir, filename) = self
            .resolver
            .metapath(space, subpath, &meta.shortname, kind)?;
        let path = dir.join(&filename);
        if !path.is_file() {
            return Err(StoreError::NotFound(format!(
                "{} '{}' in {}/{}",
                kind, meta.shortname, space, subpath
            )));
        }

        fs::remove_file(&path)?;
        for sibling in files_with_stem(&dir, &meta.shortname)? {
            fs::remove_file(&sibling)?;
        }

        if !kind.is_attachment() {
            if let Some(payload) = &meta.payload {
                let payload_path = self
                    .resolver
                    .payload_dir(space, subpath, kind)?
                    .join(&payload.body);
                if payload_path.is_file() && has_stem(&payload_path, &meta.shortname) {
                    fs::remove_file(&payload_path)?;
                }
            }
        }

        let space_dir = self.resolver.space_dir(space)?;
        prune_empty_dirs(&dir, &space_dir)?;

        tracing::info!(space, subpath, shortname = %meta.shortname, resource_type = %kind, "deleted");
        Ok(())
    }

    /// Canonical display form of a subpath, as used in records and index keys.
    pub fn canonical_subpath(&self, subpath: &str) -> Result<String> {
        normalize_subpath(subpath)
    }
}

pub(crate) fn read_meta(path: &Path, kind: ResourceType) -> Result<Meta> {
    let content = fs::read_to_string(path)?;
    let mut meta: Meta = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    meta.resource_type = kind;
    Ok(meta)
}

fn write_meta(path: &Path, meta: &Meta) -> Result<()> {
    write_meta_to(File::create(path)?, meta)
}

fn write_meta_to(mut file: File, meta: &Meta) -> Result<()> {
    let body = serde_json::to_vec_pretty(meta).map_err(|e| StoreError::Corrupt {
        path: PathBuf::from(&meta.shortname),
        source: e,
    })?;
    file.write_all(&body)?;
    Ok(())
}

fn has_stem(path: &Path, stem: &str) -> bool {
    path.file_stem().and_then(|s| s.to_str()) == Some(stem)
}

/// Regular files in `dir` whose stem is exactly `stem`, in name order.
fn files_with_stem(dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && has_stem(&path, stem) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches)
}

fn renamed_with_extension(path: &Path, stem: &str) -> String {
    match path.extension() {
        Some(ext) => format!("{}.{}", stem, ext.to_string_lossy()),
        None => stem.to_string(),
    }
}

/// Move every payload file named after `src_shortname` to `dst_dir` under
/// `dst_shortname`, keeping extensions. The file `payload.body` pointed at
/// (or else the first one moved) becomes the new `payload.body`.
fn relocate_sibling_payloads(
    src_dir: &Path,
    dst_dir: &Path,
    src_shortname: &str,
    dst_shortname: &str,
    meta: &mut Meta,
) -> Result<bool> {
    let mut moved = Vec::new();
    for path in files_with_stem(src_dir, src_shortname)? {
        let renamed = renamed_with_extension(&path, dst_shortname);
        fs::rename(&path, dst_dir.join(&renamed))?;
        let original = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        moved.push((original, renamed));
    }

    let Some(payload) = meta.payload.as_mut() else {
        return Ok(false);
    };
    let chosen = moved
        .iter()
        .find(|(original, _)| *original == payload.body)
        .or_else(|| moved.first());
    match chosen {
        Some((_, renamed)) => {
            payload.body = renamed.clone();
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Move one entry out of `.meta/<shortname>/`.
///
/// Entries of different kinds with the same shortname share that directory,
/// on either side of the move. Only `meta_file` moves, together with the
/// `attachments.*` directories when no other entry stays behind. A whole
/// directory rename is used when nothing is shared.
fn move_entry_files(src_dir: &Path, dst_dir: &Path, meta_file: &str) -> Result<()> {
    let shared = has_other_meta_files(src_dir, meta_file)?;
    if !shared && !dst_dir.exists() {
        return rename_dir(src_dir, dst_dir);
    }

    let attachments = if shared {
        Vec::new()
    } else {
        attachment_dirs(src_dir)?
    };
    for dir in &attachments {
        if let Some(name) = dir.file_name() {
            if dst_dir.join(name).exists() {
                return Err(StoreError::Conflict(format!(
                    "destination exists: {}",
                    dst_dir.join(name).display()
                )));
            }
        }
    }

    fs::create_dir_all(dst_dir)?;
    fs::rename(src_dir.join(meta_file), dst_dir.join(meta_file))?;
    for dir in attachments {
        if let Some(name) = dir.file_name() {
            fs::rename(&dir, dst_dir.join(name))?;
        }
    }
    Ok(())
}

fn has_other_meta_files(dir: &Path, meta_file: &str) -> Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name != meta_file && name.starts_with("meta.") && entry.file_type()?.is_file() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn attachment_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir()
            && entry.file_name().to_string_lossy().starts_with("attachments.")
        {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Rename a directory, allowing an empty placeholder at the destination.
fn rename_dir(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        let empty = dst.is_dir() && fs::read_dir(dst)?.next().is_none();
        if !empty {
            return Err(StoreError::Conflict(format!(
                "destination exists: {}",
                dst.display()
            )));
        }
        fs::remove_dir(dst)?;
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(src, dst)?;
    Ok(())
}

/// Remove `start` and each ancestor that is empty, stopping at (and never
/// removing) `stop`. A non-empty directory ends the walk.
pub(crate) fn prune_empty_dirs(start: &Path, stop: &Path) -> Result<()> {
    let mut dir = start.to_path_buf();
    while dir.starts_with(stop) && dir != stop {
        match fs::read_dir(&dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            // Something appeared between the check and the removal.
            Err(_) => break,
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, MetadataStore) {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(PathResolver::new(tmp.path()), 4);
        (tmp, store)
    }

    #[test]
    fn test_create_then_load_round_trip() {
        let (_tmp, store) = store();
        let meta = Meta::new(ResourceType::Content, "a", "admin")
            .with_displayname("Alpha")
            .with_tags(["x", "y"]);
        store.create("acme", "/posts", &meta).unwrap();

        let loaded = store
            .load("acme", "posts", "a", ResourceType::Content)
            .unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_create_twice_conflicts() {
        let (_tmp, store) = store();
        let meta = Meta::new(ResourceType::Content, "a", "admin");
        store.create("acme", "posts", &meta).unwrap();
        let err = store.create("acme", "posts", &meta).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_same_shortname_different_kind_coexist() {
        let (_tmp, store) = store();
        store
            .create("acme", "posts", &Meta::new(ResourceType::Content, "a", "admin"))
            .unwrap();
        store
            .create("acme", "posts", &Meta::new(ResourceType::Post, "a", "admin"))
            .unwrap();
        assert!(store.load("acme", "posts", "a", ResourceType::Post).is_ok());
    }

    #[test]
    fn test_update_requires_existing() {
        let (_tmp, store) = store();
        let mut meta = Meta::new(ResourceType::Content, "a", "admin");
        assert!(store.update("acme", "posts", &meta).unwrap_err().is_not_found());

        store.create("acme", "posts", &meta).unwrap();
        meta.description = Some("changed".into());
        store.update("acme", "posts", &meta).unwrap();
        let loaded = store.load("acme", "posts", "a", ResourceType::Content).unwrap();
        assert_eq!(loaded.description.as_deref(), Some("changed"));
    }

    #[test]
    fn test_update_is_full_replace() {
        let (_tmp, store) = store();
        let meta = Meta::new(ResourceType::Content, "a", "admin").with_displayname("Alpha");
        store.create("acme", "posts", &meta).unwrap();

        let mut replacement = meta.clone();
        replacement.displayname = None;
        store.update("acme", "posts", &replacement).unwrap();
        let loaded = store.load("acme", "posts", "a", ResourceType::Content).unwrap();
        assert!(loaded.displayname.is_none());
    }

    #[test]
    fn test_save_payload_streams_in_chunks() {
        let (tmp, store) = store();
        let meta = Meta::new(ResourceType::Content, "a", "admin");
        store.create("acme", "posts", &meta).unwrap();

        let data = b"0123456789abcdef0123".to_vec();
        let name = store
            .save_payload("acme", "posts", &meta, "upload.bin", &data[..])
            .unwrap();
        assert_eq!(name, "a.bin");
        let written = fs::read(tmp.path().join("acme/posts/a.bin")).unwrap();
        assert_eq!(written, data);
    }

    #[test]
    fn test_save_payload_requires_meta() {
        let (_tmp, store) = store();
        let meta = Meta::new(ResourceType::Content, "ghost", "admin");
        let err = store
            .save_payload("acme", "posts", &meta, "x.png", &b"png"[..])
            .unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .save_payload_from_json("acme", "posts", &meta, &serde_json::json!({}))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_prunes_empty_dirs() {
        let (tmp, store) = store();
        let meta = Meta::new(ResourceType::Content, "a", "admin");
        store.create("acme", "posts", &meta).unwrap();
        store.delete("acme", "posts", &meta).unwrap();

        assert!(store
            .load("acme", "posts", "a", ResourceType::Content)
            .unwrap_err()
            .is_not_found());
        assert!(!tmp.path().join("acme/posts/.meta/a").exists());
        assert!(!tmp.path().join("acme/posts").exists());
        assert!(tmp.path().join("acme").exists());
    }

    #[test]
    fn test_delete_keeps_non_empty_dirs() {
        let (tmp, store) = store();
        let a = Meta::new(ResourceType::Content, "a", "admin");
        let b = Meta::new(ResourceType::Content, "b", "admin");
        store.create("acme", "posts", &a).unwrap();
        store.create("acme", "posts", &b).unwrap();
        store.delete("acme", "posts", &a).unwrap();

        assert!(tmp.path().join("acme/posts/.meta").is_dir());
        assert!(store.load("acme", "posts", "b", ResourceType::Content).is_ok());
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (_tmp, store) = store();
        let meta = Meta::new(ResourceType::Content, "a", "admin");
        assert!(store.delete("acme", "posts", &meta).unwrap_err().is_not_found());
    }

    #[test]
    fn test_prune_stops_at_boundary() {
        let tmp = TempDir::new().unwrap();
        let deep = tmp.path().join("space/a/b/c");
        fs::create_dir_all(&deep).unwrap();
        prune_empty_dirs(&deep, &tmp.path().join("space")).unwrap();
        assert!(!tmp.path().join("space/a").exists());
        assert!(tmp.path().join("space").exists());
    }
}
