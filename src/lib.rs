//! # Strata
//!
//! A hierarchical, file-backed structured-content store.
//!
//! Resources are persisted as individual JSON meta documents inside a
//! directory tree addressed by space / subpath / shortname, optionally
//! carrying a payload file and nested attachment documents. A SQLite FTS5
//! index mirrors the documents for free-text and structured search.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐
//!            │ PathResolver │  (space, subpath, shortname, kind) ⇄ path
//!            └──────┬───────┘
//!         ┌─────────┴─────────┐
//!         ▼                   ▼
//! ┌───────────────┐   ┌──────────────┐      ┌──────────────┐
//! │ MetadataStore │   │ QueryEngine  │─────▶│ SearchIndex  │
//! │  (writes)     │   │  (reads)     │      │ SQLite FTS5  │
//! └───────┬───────┘   └──────────────┘      └──────▲───────┘
//!         │                                        │
//!         └──────── caller syncs after writes ─────┘
//! ```
//!
//! The store never talks to the index. Callers (the `strata` CLI here)
//! upsert into the index after each successful write, so the index is
//! eventually consistent with the tree, not transactionally.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors and boundary payloads |
//! | [`models`] | Core data types |
//! | [`resolver`] | On-disk layout, both directions |
//! | [`store`] | Create / load / update / move / delete |
//! | [`query`] | Subpath scans, spaces listing, search delegation |
//! | [`index`] | Search index sync and search |
//! | [`sync`] | Full re-index from the tree |
//! | [`db`] | Database connection |

pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod models;
pub mod query;
pub mod resolver;
pub mod store;
pub mod sync;

pub use error::{ErrorPayload, Result, StoreError};
pub use index::SearchIndex;
pub use models::{Locator, Meta, Query, QueryResponse, QueryType, Record, ResourceType};
pub use query::QueryEngine;
pub use resolver::PathResolver;
pub use store::MetadataStore;
