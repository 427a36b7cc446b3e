//! Core data models used throughout Strata.
//!
//! These types represent the meta documents persisted in the tree, the
//! lightweight locators and enriched records returned by queries, and the
//! query request itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Closed set of resource kinds. The lowercase tag doubles as the on-disk
/// type marker (`meta.<tag>.json`, `attachments.<tag>/`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Space,
    Folder,
    #[default]
    Content,
    Post,
    Schema,
    Comment,
    Reaction,
    Media,
}

impl ResourceType {
    pub const ALL: [ResourceType; 8] = [
        ResourceType::Space,
        ResourceType::Folder,
        ResourceType::Content,
        ResourceType::Post,
        ResourceType::Schema,
        ResourceType::Comment,
        ResourceType::Reaction,
        ResourceType::Media,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Space => "space",
            ResourceType::Folder => "folder",
            ResourceType::Content => "content",
            ResourceType::Post => "post",
            ResourceType::Schema => "schema",
            ResourceType::Comment => "comment",
            ResourceType::Reaction => "reaction",
            ResourceType::Media => "media",
        }
    }

    /// Attachments live nested under a parent entry's `.meta/<parent>/` directory.
    pub fn is_attachment(&self) -> bool {
        matches!(
            self,
            ResourceType::Comment | ResourceType::Reaction | ResourceType::Media
        )
    }

    /// Plain entries: `<subpath>/.meta/<shortname>/meta.<tag>.json`.
    pub fn is_entry(&self) -> bool {
        !self.is_attachment() && !matches!(self, ResourceType::Space | ResourceType::Folder)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::Validation(format!("unknown resource type: '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Json,
    Text,
    Markdown,
    Html,
    Image,
    Audio,
    Video,
    Pdf,
}

impl ContentType {
    /// Best guess from a file extension, used when a binary payload is uploaded.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(ContentType::Json),
            "txt" => Some(ContentType::Text),
            "md" | "markdown" => Some(ContentType::Markdown),
            "html" | "htm" => Some(ContentType::Html),
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" => Some(ContentType::Image),
            "mp3" | "ogg" | "wav" => Some(ContentType::Audio),
            "mp4" | "webm" | "mov" => Some(ContentType::Video),
            "pdf" => Some(ContentType::Pdf),
            _ => None,
        }
    }
}

/// Reference to the payload file stored next to a meta document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_shortname: Option<String>,
    /// On-disk filename of the payload, conventionally `<shortname>.<ext>`.
    pub body: String,
}

/// The persisted record for one resource instance.
///
/// `resource_type` is not written into the document: the filename (or the
/// attachment directory) carries it, and [`MetadataStore::load`](crate::store::MetadataStore::load)
/// fills it back in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(skip)]
    pub resource_type: ResourceType,
    pub uuid: Uuid,
    pub shortname: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_shortname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

fn default_active() -> bool {
    true
}

/// Attribute names a query may request through `include_fields`.
pub const ATTRIBUTE_NAMES: [&str; 8] = [
    "is_active",
    "displayname",
    "description",
    "tags",
    "created_at",
    "updated_at",
    "owner_shortname",
    "payload",
];

impl Meta {
    pub fn new(resource_type: ResourceType, shortname: &str, owner_shortname: &str) -> Self {
        let now = Utc::now();
        Self {
            resource_type,
            uuid: Uuid::new_v4(),
            shortname: shortname.to_string(),
            is_active: true,
            displayname: None,
            description: None,
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            owner_shortname: owner_shortname.to_string(),
            payload: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_displayname(mut self, displayname: &str) -> Self {
        self.displayname = Some(displayname.to_string());
        self
    }

    pub fn has_any_tag(&self, wanted: &BTreeSet<String>) -> bool {
        wanted.iter().any(|t| self.tags.contains(t))
    }

    /// Project into a [`Record`] carrying only the requested attributes.
    ///
    /// An empty `include_fields` keeps every set attribute.
    pub fn to_record(&self, subpath: &str, include_fields: &[String]) -> Record {
        let mut attributes = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        attributes.remove("uuid");
        attributes.remove("shortname");
        if !include_fields.is_empty() {
            attributes.retain(|k, _| include_fields.iter().any(|f| f == k));
        }

        Record {
            resource_type: self.resource_type,
            uuid: self.uuid,
            shortname: self.shortname.clone(),
            subpath: subpath.to_string(),
            attributes,
            attachments: BTreeMap::new(),
        }
    }
}

/// Minimal identity tuple for lightweight listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub uuid: Uuid,
    pub space_name: String,
    pub subpath: String,
    pub shortname: String,
    pub resource_type: ResourceType,
}

/// Field-projected, attachment-enriched view of a meta document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub resource_type: ResourceType,
    pub uuid: Uuid,
    pub shortname: String,
    pub subpath: String,
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<ResourceType, Vec<Record>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Subpath,
    Search,
    Spaces,
}

/// A query request as received from the routing layer.
///
/// Unknown fields are rejected at deserialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Query {
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub space_name: String,
    #[serde(default = "default_subpath")]
    pub subpath: String,
    #[serde(default)]
    pub search_text: Option<String>,
    #[serde(default)]
    pub filter_types: BTreeSet<ResourceType>,
    #[serde(default)]
    pub filter_shortnames: BTreeSet<String>,
    #[serde(default)]
    pub filter_tags: BTreeSet<String>,
    #[serde(default)]
    pub include_fields: Vec<String>,
    #[serde(default)]
    pub retrieve_json_payload: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_subpath() -> String {
    "/".to_string()
}

fn default_limit() -> usize {
    10
}

impl Query {
    pub fn new(query_type: QueryType, space_name: &str, subpath: &str) -> Self {
        Self {
            query_type,
            space_name: space_name.to_string(),
            subpath: subpath.to_string(),
            search_text: None,
            filter_types: BTreeSet::new(),
            filter_shortnames: BTreeSet::new(),
            filter_tags: BTreeSet::new(),
            include_fields: Vec::new(),
            retrieve_json_payload: false,
            offset: 0,
            limit: default_limit(),
        }
    }

    pub fn subpath(space_name: &str, subpath: &str) -> Self {
        Self::new(QueryType::Subpath, space_name, subpath)
    }

    pub fn search(space_name: &str, text: &str) -> Self {
        let mut query = Self::new(QueryType::Search, space_name, "/");
        query.search_text = Some(text.to_string());
        query
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Reject parameters the engine would otherwise misinterpret.
    pub fn validate(&self, max_limit: usize) -> Result<()> {
        if self.query_type != QueryType::Spaces && self.space_name.trim().is_empty() {
            return Err(StoreError::Validation("space_name must not be empty".into()));
        }
        if self.limit == 0 || self.limit > max_limit {
            return Err(StoreError::Validation(format!(
                "limit must be in 1..={}, got {}",
                max_limit, self.limit
            )));
        }
        if let Some(unknown) = self
            .include_fields
            .iter()
            .find(|f| !ATTRIBUTE_NAMES.contains(&f.as_str()))
        {
            return Err(StoreError::Validation(format!(
                "unknown field in include_fields: '{}'",
                unknown
            )));
        }
        Ok(())
    }

    pub fn accepts_type(&self, resource_type: ResourceType) -> bool {
        self.filter_types.is_empty() || self.filter_types.contains(&resource_type)
    }

    pub fn accepts_shortname(&self, shortname: &str) -> bool {
        self.filter_shortnames.is_empty() || self.filter_shortnames.contains(shortname)
    }

    pub fn accepts_tags(&self, meta: &Meta) -> bool {
        self.filter_tags.is_empty() || meta.has_any_tag(&self.filter_tags)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub total: usize,
    pub returned: usize,
    pub records: Vec<Record>,
}

impl QueryResponse {
    pub fn new(total: usize, records: Vec<Record>) -> Self {
        Self {
            total,
            returned: records.len(),
            records,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorsResponse {
    pub total: usize,
    pub locators: Vec<Locator>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_lookup() {
        for t in ResourceType::ALL {
            assert_eq!(t.as_str().parse::<ResourceType>().unwrap(), t);
        }
        let err = "widget".parse::<ResourceType>().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_attachment_kinds() {
        assert!(ResourceType::Media.is_attachment());
        assert!(ResourceType::Comment.is_attachment());
        assert!(!ResourceType::Content.is_attachment());
        assert!(ResourceType::Post.is_entry());
        assert!(!ResourceType::Folder.is_entry());
    }

    #[test]
    fn test_meta_omits_unset_fields() {
        let meta = Meta::new(ResourceType::Content, "a", "admin");
        let json = serde_json::to_value(&meta).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("displayname"));
        assert!(!obj.contains_key("payload"));
        assert!(!obj.contains_key("tags"));
        assert!(!obj.contains_key("resource_type"));
        assert_eq!(obj["shortname"], "a");
    }

    #[test]
    fn test_to_record_projection() {
        let meta = Meta::new(ResourceType::Post, "p1", "admin")
            .with_displayname("First")
            .with_tags(["x"]);

        let full = meta.to_record("posts", &[]);
        assert_eq!(full.resource_type, ResourceType::Post);
        assert!(full.attributes.contains_key("displayname"));
        assert!(full.attributes.contains_key("owner_shortname"));
        assert!(!full.attributes.contains_key("uuid"));

        let narrow = meta.to_record("posts", &["tags".to_string()]);
        assert_eq!(narrow.attributes.len(), 1);
        assert_eq!(narrow.attributes["tags"], serde_json::json!(["x"]));
    }

    #[test]
    fn test_query_rejects_unknown_fields() {
        let raw = r#"{"type": "subpath", "space_name": "s", "bogus": 1}"#;
        assert!(serde_json::from_str::<Query>(raw).is_err());

        let raw = r#"{"type": "everything", "space_name": "s"}"#;
        assert!(serde_json::from_str::<Query>(raw).is_err());
    }

    #[test]
    fn test_query_validate() {
        let query = Query::subpath("s", "/posts");
        assert!(query.validate(100).is_ok());
        assert!(query.clone().page(0, 0).validate(100).is_err());
        assert!(query.clone().page(0, 101).validate(100).is_err());

        let mut bad = query;
        bad.include_fields = vec!["secret".into()];
        assert!(bad.validate(100).is_err());
    }

    #[test]
    fn test_query_defaults_from_json() {
        let raw = r#"{"type": "subpath", "space_name": "s", "filter_types": ["post"]}"#;
        let query: Query = serde_json::from_str(raw).unwrap();
        assert_eq!(query.subpath, "/");
        assert_eq!(query.limit, 10);
        assert!(query.accepts_type(ResourceType::Post));
        assert!(!query.accepts_type(ResourceType::Content));
    }
}
