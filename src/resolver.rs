//! Path resolution between resource identities and the on-disk layout.
//!
//! All paths are relative to a space directory under the spaces root:
//!
//! ```text
//! <subpath>/.meta/<shortname>/meta.<type>.json                         entry
//! <subpath>/<shortname>/.meta/meta.folder.json                         folder
//! <parent>/.meta/<parent_name>/attachments.<type>/meta.<shortname>.json attachment
//! .meta/meta.space.json                                                space marker
//! ```
//!
//! Nothing in this module touches the filesystem. Every other component
//! derives its paths from [`PathResolver`], and the scanner uses
//! [`parse_meta_path`] to go the other way.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::error::{Result, StoreError};
use crate::models::ResourceType;

pub const META_DIR: &str = ".meta";
pub const META_EXT: &str = "json";

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("valid name regex"));
static META_FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^meta\.([A-Za-z0-9_\-]+)\.json$").expect("valid meta regex"));
static ATTACHMENTS_DIR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^attachments\.([a-z]+)$").expect("valid attachments regex"));

/// Maps `(space, subpath, shortname, kind)` to directories under a fixed root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn space_dir(&self, space: &str) -> Result<PathBuf> {
        validate_name(space, "space name")?;
        Ok(self.root.join(space))
    }

    /// Directory a subpath query scans.
    pub fn subpath_dir(&self, space: &str, subpath: &str) -> Result<PathBuf> {
        let subpath = normalize_subpath(subpath)?;
        Ok(join_rel(self.space_dir(space)?, &subpath))
    }

    /// Directory and filename of a meta document.
    pub fn metapath(
        &self,
        space: &str,
        subpath: &str,
        shortname: &str,
        kind: ResourceType,
    ) -> Result<(PathBuf, String)> {
        validate_name(shortname, "shortname")?;
        let space_dir = self.space_dir(space)?;
        let subpath = normalize_subpath(subpath)?;

        let resolved = match kind {
            ResourceType::Space => (space_dir.join(META_DIR), meta_filename(kind.as_str())),
            ResourceType::Folder => (
                join_rel(space_dir, &subpath).join(shortname).join(META_DIR),
                meta_filename(kind.as_str()),
            ),
            k if k.is_attachment() => (
                attachments_dir(&space_dir, &subpath, k)?,
                meta_filename(shortname),
            ),
            k => (
                join_rel(space_dir, &subpath).join(META_DIR).join(shortname),
                meta_filename(k.as_str()),
            ),
        };
        Ok(resolved)
    }

    /// Full path of a meta document.
    pub fn meta_file(
        &self,
        space: &str,
        subpath: &str,
        shortname: &str,
        kind: ResourceType,
    ) -> Result<PathBuf> {
        let (dir, filename) = self.metapath(space, subpath, shortname, kind)?;
        Ok(dir.join(filename))
    }

    /// Directory holding payload files. Payload filenames are derived from
    /// the shortname, so only the directory is returned.
    pub fn payload_dir(&self, space: &str, subpath: &str, kind: ResourceType) -> Result<PathBuf> {
        let space_dir = self.space_dir(space)?;
        let subpath = normalize_subpath(subpath)?;
        if kind.is_attachment() {
            attachments_dir(&space_dir, &subpath, kind)
        } else {
            Ok(join_rel(space_dir, &subpath))
        }
    }
}

fn meta_filename(stem: &str) -> String {
    format!("meta.{}.{}", stem, META_EXT)
}

fn join_rel(base: PathBuf, subpath: &str) -> PathBuf {
    if subpath.is_empty() {
        base
    } else {
        base.join(subpath)
    }
}

fn attachments_dir(space_dir: &Path, subpath: &str, kind: ResourceType) -> Result<PathBuf> {
    let (parent_subpath, parent_name) = split_parent(subpath)?;
    Ok(join_rel(space_dir.to_path_buf(), parent_subpath)
        .join(META_DIR)
        .join(parent_name)
        .join(format!("attachments.{}", kind.as_str())))
}

/// Split `a/b/c` into (`a/b`, `c`). Attachments need a parent entry, so the
/// root subpath is rejected.
pub fn split_parent(subpath: &str) -> Result<(&str, &str)> {
    match subpath.rsplit_once('/') {
        Some((parent, name)) => Ok((parent, name)),
        None if !subpath.is_empty() => Ok(("", subpath)),
        None => Err(StoreError::Validation(
            "attachment subpath must name a parent entry".into(),
        )),
    }
}

/// Canonical subpath form: relative, `/`-separated, no leading or trailing
/// separator, root as the empty string. `/posts`, `./posts/` and `posts`
/// all normalize to `posts`.
///
/// Every segment must satisfy the same name rule as shortnames, which is
/// also what [`parse_meta_path`] accepts when scanning.
pub fn normalize_subpath(subpath: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in subpath.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(StoreError::Validation(format!(
                    "subpath may not contain '..': '{}'",
                    subpath
                )))
            }
            META_DIR => {
                return Err(StoreError::Validation(format!(
                    "subpath may not contain '{}': '{}'",
                    META_DIR, subpath
                )))
            }
            p if NAME_PATTERN.is_match(p) => parts.push(p),
            p => {
                return Err(StoreError::Validation(format!(
                    "invalid subpath segment '{}' in '{}' (allowed: letters, digits, '_' and '-')",
                    p, subpath
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

pub fn join_subpath(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

pub fn validate_name(name: &str, what: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "invalid {}: '{}' (allowed: letters, digits, '_' and '-')",
            what, name
        )))
    }
}

/// Identity recovered from a meta document's location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaLocation {
    pub space: String,
    pub subpath: String,
    pub shortname: String,
    pub resource_type: ResourceType,
}

/// Reverse of [`PathResolver::metapath`]: parse a path relative to the
/// spaces root. Anything that does not fit one of the four layouts, or
/// carries an unknown type tag, is [`StoreError::InvalidPattern`].
pub fn parse_meta_path(relative: &Path) -> Result<MetaLocation> {
    let invalid = || StoreError::InvalidPattern(relative.to_path_buf());

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
            _ => return Err(invalid()),
        }
    }

    let (filename, dirs) = parts.split_last().ok_or_else(invalid)?;
    let stem = META_FILE_PATTERN
        .captures(filename)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(invalid)?;
    let (space, dirs) = dirs.split_first().ok_or_else(invalid)?;
    if !NAME_PATTERN.is_match(space) {
        return Err(invalid());
    }

    let plain = |segments: &[&str]| -> Result<String> {
        if segments.iter().all(|s| NAME_PATTERN.is_match(s)) {
            Ok(segments.join("/"))
        } else {
            Err(invalid())
        }
    };

    let location = |subpath: String, shortname: &str, resource_type| MetaLocation {
        space: space.to_string(),
        subpath,
        shortname: shortname.to_string(),
        resource_type,
    };

    match dirs {
        // <space>/.meta/meta.space.json
        [meta] if *meta == META_DIR && stem == "space" => {
            Ok(location(String::new(), space, ResourceType::Space))
        }
        // <subpath>/<folder>/.meta/meta.folder.json
        [prefix @ .., folder, meta] if *meta == META_DIR && stem == "folder" => {
            if !NAME_PATTERN.is_match(folder) {
                return Err(invalid());
            }
            Ok(location(plain(prefix)?, folder, ResourceType::Folder))
        }
        // <parent>/.meta/<parent_name>/attachments.<type>/meta.<shortname>.json
        [prefix @ .., meta, parent, attachments]
            if *meta == META_DIR && ATTACHMENTS_DIR_PATTERN.is_match(attachments) =>
        {
            let tag = &attachments["attachments.".len()..];
            let kind = tag.parse::<ResourceType>().map_err(|_| invalid())?;
            if !kind.is_attachment() || !NAME_PATTERN.is_match(parent) {
                return Err(invalid());
            }
            let subpath = join_subpath(&plain(prefix)?, parent);
            Ok(location(subpath, stem, kind))
        }
        // <subpath>/.meta/<shortname>/meta.<type>.json
        [prefix @ .., meta, shortname] if *meta == META_DIR => {
            let kind = stem.parse::<ResourceType>().map_err(|_| invalid())?;
            if !kind.is_entry() || !NAME_PATTERN.is_match(shortname) {
                return Err(invalid());
            }
            Ok(location(plain(prefix)?, shortname, kind))
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new("/data")
    }

    #[test]
    fn test_entry_layout() {
        let (dir, file) = resolver()
            .metapath("acme", "/posts", "hello", ResourceType::Post)
            .unwrap();
        assert_eq!(dir, PathBuf::from("/data/acme/posts/.meta/hello"));
        assert_eq!(file, "meta.post.json");
    }

    #[test]
    fn test_folder_layout() {
        let (dir, file) = resolver()
            .metapath("acme", "posts", "2024", ResourceType::Folder)
            .unwrap();
        assert_eq!(dir, PathBuf::from("/data/acme/posts/2024/.meta"));
        assert_eq!(file, "meta.folder.json");
    }

    #[test]
    fn test_attachment_layout() {
        let (dir, file) = resolver()
            .metapath("acme", "/posts/hello", "img1", ResourceType::Media)
            .unwrap();
        assert_eq!(
            dir,
            PathBuf::from("/data/acme/posts/.meta/hello/attachments.media")
        );
        assert_eq!(file, "meta.img1.json");
    }

    #[test]
    fn test_attachment_under_root_entry() {
        let (dir, _) = resolver()
            .metapath("acme", "hello", "c1", ResourceType::Comment)
            .unwrap();
        assert_eq!(dir, PathBuf::from("/data/acme/.meta/hello/attachments.comment"));
    }

    #[test]
    fn test_attachment_requires_parent() {
        let err = resolver()
            .metapath("acme", "/", "c1", ResourceType::Comment)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_space_layout() {
        let (dir, file) = resolver()
            .metapath("acme", "", "acme", ResourceType::Space)
            .unwrap();
        assert_eq!(dir, PathBuf::from("/data/acme/.meta"));
        assert_eq!(file, "meta.space.json");
    }

    #[test]
    fn test_payload_dir() {
        let r = resolver();
        assert_eq!(
            r.payload_dir("acme", "/posts", ResourceType::Content).unwrap(),
            PathBuf::from("/data/acme/posts")
        );
        assert_eq!(
            r.payload_dir("acme", "posts/hello", ResourceType::Media).unwrap(),
            PathBuf::from("/data/acme/posts/.meta/hello/attachments.media")
        );
    }

    #[test]
    fn test_normalize_subpath() {
        assert_eq!(normalize_subpath("/posts/").unwrap(), "posts");
        assert_eq!(normalize_subpath("./posts//a").unwrap(), "posts/a");
        assert_eq!(normalize_subpath("/").unwrap(), "");
        assert!(normalize_subpath("posts/../etc").is_err());
        assert!(normalize_subpath("posts/.meta").is_err());
        assert!(normalize_subpath("docs/v1.0").is_err());
        assert!(normalize_subpath("my docs").is_err());
    }

    #[test]
    fn test_rejects_bad_shortname() {
        assert!(resolver()
            .metapath("acme", "posts", "../x", ResourceType::Content)
            .is_err());
        assert!(resolver()
            .metapath("acme", "posts", "", ResourceType::Content)
            .is_err());
    }

    #[test]
    fn test_parse_round_trips_every_layout() {
        let r = resolver();
        let cases = [
            ("acme", "posts", "hello", ResourceType::Post),
            ("acme", "", "top", ResourceType::Content),
            ("acme", "posts", "2024", ResourceType::Folder),
            ("acme", "posts/hello", "img1", ResourceType::Media),
            ("acme", "", "acme", ResourceType::Space),
        ];
        for (space, subpath, shortname, kind) in cases {
            let path = r.meta_file(space, subpath, shortname, kind).unwrap();
            let rel = path.strip_prefix(r.root()).unwrap();
            let loc = parse_meta_path(rel).unwrap();
            assert_eq!(loc.space, space);
            assert_eq!(loc.subpath, subpath);
            assert_eq!(loc.shortname, shortname);
            assert_eq!(loc.resource_type, kind);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let err = parse_meta_path(Path::new("acme/posts/.meta/x/meta.widget.json")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPattern(_)));
    }

    #[test]
    fn test_parse_rejects_attachment_tag_as_entry() {
        assert!(parse_meta_path(Path::new("acme/posts/.meta/x/meta.media.json")).is_err());
        assert!(parse_meta_path(Path::new("acme/posts/.meta/x/attachments.post/meta.y.json")).is_err());
    }

    #[test]
    fn test_parse_rejects_payload_files() {
        assert!(parse_meta_path(Path::new("acme/posts/hello.json")).is_err());
        assert!(parse_meta_path(Path::new("acme/posts/.meta/x/notes.txt")).is_err());
    }
}
