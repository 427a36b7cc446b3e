//! Search index mirroring meta documents into SQLite.
//!
//! Each document is stored under the composite key
//! `meta:<subpath>/<shortname>/<uuid>/<resource_type>`, scoped by its
//! space name, in three tables:
//!
//! | Table | Role |
//! |-------|------|
//! | `meta_documents` | full JSON document plus numeric/sortable columns |
//! | `meta_tags` | one row per tag, for tag filters |
//! | `meta_fts` | FTS5 table over the text fields |
//!
//! The FTS5 tokenizer keeps `_` and `-` inside tokens and does no stemming,
//! so identifiers and type tags match literally.
//!
//! Sync is push-based: callers upsert after a successful store write. The
//! index is never read-modify-write consistent with the tree; a crash
//! between the two leaves it stale until the next write or a rebuild.

use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;

use crate::db;
use crate::error::{Result, StoreError};
use crate::models::{Meta, Query, ResourceType};
use crate::resolver::normalize_subpath;

/// Text columns indexed by FTS5, in table order.
const FTS_COLUMNS: [&str; 11] = [
    "uuid",
    "shortname",
    "subpath",
    "resource_type",
    "displayname",
    "description",
    "owner_shortname",
    "payload_content_type",
    "payload_body",
    "schema_shortname",
    "tags",
];

/// One document returned by [`SearchIndex::search`].
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub subpath: String,
    pub meta: Meta,
}

#[derive(Debug, Clone)]
pub struct SearchIndex {
    pool: SqlitePool,
}

impl SearchIndex {
    /// Open (creating if needed) the index database and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        let index = Self { pool };
        index.ensure_schema().await?;
        Ok(index)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Composite key for a document.
    pub fn doc_id(subpath: &str, meta: &Meta) -> String {
        format!(
            "meta:{}/{}/{}/{}",
            subpath, meta.shortname, meta.uuid, meta.resource_type
        )
    }

    /// Create the tables if they do not exist yet. Idempotent.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta_documents (
                space_name TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                subpath TEXT NOT NULL,
                shortname TEXT NOT NULL,
                uuid TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                document TEXT NOT NULL,
                PRIMARY KEY (space_name, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta_tags (
                space_name TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (space_name, doc_id, tag)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // FTS5 CREATE is not idempotent natively, so we check first
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='meta_fts'",
        )
        .fetch_one(&self.pool)
        .await?;

        if !fts_exists {
            let create = format!(
                "CREATE VIRTUAL TABLE meta_fts USING fts5(space_name UNINDEXED, doc_id UNINDEXED, {}, tokenize = \"unicode61 tokenchars '_-'\")",
                FTS_COLUMNS.join(", ")
            );
            sqlx::query(&create).execute(&self.pool).await?;
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_meta_documents_space ON meta_documents(space_name)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_meta_documents_updated_at ON meta_documents(updated_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_meta_tags_tag ON meta_tags(tag)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Drop every indexed document and recreate an empty schema.
    pub async fn rebuild(&self) -> Result<()> {
        for table in ["meta_fts", "meta_tags", "meta_documents"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&self.pool)
                .await?;
        }
        self.ensure_schema().await?;
        tracing::info!("search index rebuilt");
        Ok(())
    }

    /// Write or replace one document at its composite key.
    pub async fn upsert(&self, space: &str, subpath: &str, meta: &Meta) -> Result<()> {
        let subpath = normalize_subpath(subpath)?;
        let doc_id = Self::doc_id(&subpath, meta);

        let mut document = match serde_json::to_value(meta) {
            Ok(Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: doc_id.clone().into(),
                    source: e,
                })
            }
        };
        document.insert(
            "resource_type".into(),
            Value::String(meta.resource_type.to_string()),
        );
        document.insert("subpath".into(), Value::String(subpath.clone()));
        document.insert("space_name".into(), Value::String(space.to_string()));
        let document = Value::Object(document).to_string();

        let tags = meta.tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let payload = meta.payload.as_ref();

        let mut tx = self.pool.begin().await?;

        delete_doc(&mut tx, space, &doc_id).await?;

        sqlx::query(
            r#"
            INSERT INTO meta_documents (space_name, doc_id, subpath, shortname, uuid,
                                        resource_type, is_active, created_at, updated_at, document)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(space)
        .bind(&doc_id)
        .bind(&subpath)
        .bind(&meta.shortname)
        .bind(meta.uuid.to_string())
        .bind(meta.resource_type.as_str())
        .bind(meta.is_active as i64)
        .bind(meta.created_at.timestamp())
        .bind(meta.updated_at.timestamp())
        .bind(&document)
        .execute(&mut *tx)
        .await?;

        for tag in &meta.tags {
            sqlx::query("INSERT INTO meta_tags (space_name, doc_id, tag) VALUES (?, ?, ?)")
                .bind(space)
                .bind(&doc_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO meta_fts (space_name, doc_id, uuid, shortname, subpath, resource_type,
                                  displayname, description, owner_shortname,
                                  payload_content_type, payload_body, schema_shortname, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(space)
        .bind(&doc_id)
        .bind(meta.uuid.to_string())
        .bind(&meta.shortname)
        .bind(&subpath)
        .bind(meta.resource_type.as_str())
        .bind(&meta.displayname)
        .bind(&meta.description)
        .bind(&meta.owner_shortname)
        .bind(payload.map(|p| content_type_tag(p.content_type)))
        .bind(payload.map(|p| p.body.clone()))
        .bind(payload.and_then(|p| p.schema_shortname.clone()))
        .bind(&tags)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(doc_id = %doc_id, "indexed");
        Ok(())
    }

    /// Remove one document. Missing documents are not an error.
    pub async fn remove(&self, space: &str, subpath: &str, meta: &Meta) -> Result<()> {
        let subpath = normalize_subpath(subpath)?;
        let doc_id = Self::doc_id(&subpath, meta);
        let mut tx = self.pool.begin().await?;
        delete_doc(&mut tx, space, &doc_id).await?;
        tx.commit().await?;
        tracing::debug!(doc_id = %doc_id, "removed from index");
        Ok(())
    }

    /// Number of indexed documents across all spaces.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meta_documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Free-text and structured search within one space.
    ///
    /// `search_text` of `None`, empty, or `*` matches everything. Otherwise
    /// each whitespace-separated term is quoted and all terms must match.
    /// Type, shortname and tag filters apply on top. Results are ordered by
    /// `updated_at` descending. Returns `(total, page)`.
    pub async fn search(&self, query: &Query) -> Result<(usize, Vec<SearchHit>)> {
        let match_expr = fts_match_expression(query.search_text.as_deref());

        let mut count_sql = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM meta_documents d");
        push_filters(&mut count_sql, query, match_expr.as_deref());
        let total: i64 = count_sql
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut page_sql =
            QueryBuilder::<Sqlite>::new("SELECT d.subpath, d.resource_type, d.document FROM meta_documents d");
        push_filters(&mut page_sql, query, match_expr.as_deref());
        page_sql
            .push(" ORDER BY d.updated_at DESC, d.doc_id ASC LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = page_sql.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let subpath: String = row.get("subpath");
            let tag: String = row.get("resource_type");
            let document: String = row.get("document");

            let resource_type = match tag.parse::<ResourceType>() {
                Ok(t) => t,
                Err(_) => {
                    tracing::warn!(resource_type = %tag, "unknown resource type in index, skipping");
                    continue;
                }
            };
            let mut meta: Meta =
                serde_json::from_str(&document).map_err(|e| StoreError::Corrupt {
                    path: format!("index:{}", subpath).into(),
                    source: e,
                })?;
            meta.resource_type = resource_type;
            hits.push(SearchHit { subpath, meta });
        }

        Ok((total.max(0) as usize, hits))
    }
}

async fn delete_doc(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    space: &str,
    doc_id: &str,
) -> Result<()> {
    for table in ["meta_fts", "meta_tags", "meta_documents"] {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE space_name = ? AND doc_id = ?",
            table
        ))
        .bind(space)
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn content_type_tag(content_type: crate::models::ContentType) -> String {
    serde_json::to_value(content_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Build an FTS5 MATCH expression, or `None` for match-all.
fn fts_match_expression(text: Option<&str>) -> Option<String> {
    let text = text.map(str::trim).unwrap_or("");
    if text.is_empty() || text == "*" {
        return None;
    }
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    Some(terms.join(" "))
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &Query, match_expr: Option<&str>) {
    builder
        .push(" WHERE d.space_name = ")
        .push_bind(query.space_name.clone());

    if let Some(expr) = match_expr {
        builder
            .push(" AND d.doc_id IN (SELECT doc_id FROM meta_fts WHERE space_name = ")
            .push_bind(query.space_name.clone())
            .push(" AND meta_fts MATCH ")
            .push_bind(expr.to_string())
            .push(")");
    }

    if !query.filter_types.is_empty() {
        builder.push(" AND d.resource_type IN (");
        let mut separated = builder.separated(", ");
        for t in &query.filter_types {
            separated.push_bind(t.as_str());
        }
        separated.push_unseparated(")");
    }

    if !query.filter_shortnames.is_empty() {
        builder.push(" AND d.shortname IN (");
        let mut separated = builder.separated(", ");
        for name in &query.filter_shortnames {
            separated.push_bind(name.clone());
        }
        separated.push_unseparated(")");
    }

    if !query.filter_tags.is_empty() {
        builder
            .push(" AND d.doc_id IN (SELECT doc_id FROM meta_tags WHERE space_name = ")
            .push_bind(query.space_name.clone())
            .push(" AND tag IN (");
        let mut separated = builder.separated(", ");
        for tag in &query.filter_tags {
            separated.push_bind(tag.clone());
        }
        separated.push_unseparated("))");
    }
}
