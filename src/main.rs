//! # Strata CLI (`strata`)
//!
//! The `strata` binary drives the storage engine from the command line:
//! it writes meta documents and payloads through the metadata store, runs
//! queries through the query engine, and keeps the search index in sync
//! after every successful write.
//!
//! ## Usage
//!
//! ```bash
//! strata --config ./config/strata.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `strata init` | Create the spaces root and the search index schema |
//! | `strata space create <name>` | Create a space marker |
//! | `strata create <space> <subpath> <shortname>` | Create a meta document |
//! | `strata get <space> <subpath> <shortname>` | Print a meta document |
//! | `strata update <space> <subpath> <shortname>` | Change fields of a meta document |
//! | `strata delete <space> <subpath> <shortname>` | Delete a document and its payload |
//! | `strata move <space> <subpath> <shortname>` | Move and/or rename a document |
//! | `strata upload <space> <subpath> <shortname> <file>` | Stream a binary payload |
//! | `strata attach-json <space> <subpath> <shortname> <file>` | Store a JSON payload |
//! | `strata query <space> [subpath]` | Subpath, search or spaces query |
//! | `strata locators <space> [subpath]` | Identity-only subpath listing |
//! | `strata reindex` | Rebuild the search index from the tree |
//!
//! Results are printed as JSON on stdout. Failures from the storage engine
//! are printed as `{"type", "code", "message"}` on stderr with a non-zero
//! exit status.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use strata::config::{self, Config, LoggingConfig};
use strata::models::{ContentType, Payload};
use strata::sync;
use strata::{Meta, MetadataStore, Query, QueryEngine, QueryType, ResourceType, SearchIndex, StoreError};

/// Strata CLI: a hierarchical, file-backed structured-content store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/strata.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "strata",
    about = "Strata: a hierarchical, file-backed structured-content store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/strata.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Addresses one document.
#[derive(Args)]
struct Target {
    /// Space name.
    space: String,
    /// Subpath within the space (`/` for the space root).
    subpath: String,
    /// Shortname of the document.
    shortname: String,
    /// Resource type: folder, content, post, schema, comment, reaction, media.
    #[arg(long = "type", short = 't', default_value = "content", value_parser = parse_resource_type)]
    resource_type: ResourceType,
}

/// Settable meta fields.
#[derive(Args)]
struct MetaFields {
    /// Display name.
    #[arg(long)]
    displayname: Option<String>,
    /// Free-text description.
    #[arg(long)]
    description: Option<String>,
    /// Tag (repeatable). On update, replaces the tag set when given.
    #[arg(long = "tag")]
    tags: Vec<String>,
}

/// Query filters shared by `query` and `locators`.
#[derive(Args)]
struct Filters {
    /// Keep only these resource types (repeatable).
    #[arg(long = "filter-type", value_parser = parse_resource_type)]
    filter_types: Vec<ResourceType>,
    /// Keep only these shortnames (repeatable).
    #[arg(long = "filter-shortname")]
    filter_shortnames: Vec<String>,
    /// Number of matches to skip.
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// Maximum number of results (defaults to `[query].default_limit`).
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the spaces root and initialize the search index schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Manage spaces.
    Space {
        #[command(subcommand)]
        action: SpaceAction,
    },

    /// Create a meta document. Fails if one already exists at that key.
    Create {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        fields: MetaFields,
        /// Owner shortname.
        #[arg(long, default_value = "admin")]
        owner: String,
    },

    /// Print a meta document.
    Get {
        #[command(flatten)]
        target: Target,
    },

    /// Update fields of an existing meta document.
    Update {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        fields: MetaFields,
        /// Set the active flag.
        #[arg(long)]
        active: Option<bool>,
    },

    /// Delete a meta document, its payload files, and empty directories.
    Delete {
        #[command(flatten)]
        target: Target,
    },

    /// Move and/or rename a meta document.
    Move {
        #[command(flatten)]
        target: Target,
        /// Destination subpath (defaults to the source subpath).
        #[arg(long)]
        to_subpath: Option<String>,
        /// Destination shortname (defaults to the source shortname).
        #[arg(long)]
        to_shortname: Option<String>,
    },

    /// Stream a binary payload file next to an existing meta document.
    Upload {
        #[command(flatten)]
        target: Target,
        /// File to upload.
        file: PathBuf,
        /// Content type; guessed from the file extension when omitted.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Store a JSON payload next to an existing meta document.
    AttachJson {
        #[command(flatten)]
        target: Target,
        /// JSON file to store.
        file: PathBuf,
        /// Schema the payload conforms to.
        #[arg(long)]
        schema: Option<String>,
    },

    /// Run a subpath, search, or spaces query.
    Query {
        /// Space name (ignored for `--type spaces`).
        space: String,
        /// Subpath to scan.
        #[arg(default_value = "/")]
        subpath: String,
        /// Query type: subpath, search, or spaces.
        #[arg(long = "type", default_value = "subpath", value_parser = parse_query_type)]
        query_type: QueryType,
        /// Free-text search term (search queries; `*` matches everything).
        #[arg(long)]
        search: Option<String>,
        /// Keep only documents carrying one of these tags (repeatable).
        #[arg(long = "filter-tag")]
        filter_tags: Vec<String>,
        /// Attributes to include in records (repeatable; default all).
        #[arg(long = "field")]
        include_fields: Vec<String>,
        /// Inline JSON payloads into records.
        #[arg(long)]
        payload: bool,
        #[command(flatten)]
        filters: Filters,
    },

    /// List locators (identity only) of a subpath.
    Locators {
        /// Space name.
        space: String,
        /// Subpath to scan.
        #[arg(default_value = "/")]
        subpath: String,
        #[command(flatten)]
        filters: Filters,
    },

    /// Drop the search index and repopulate it from the tree.
    Reindex,
}

#[derive(Subcommand)]
enum SpaceAction {
    /// Create a space.
    Create {
        /// Space name.
        name: String,
        /// Owner shortname.
        #[arg(long, default_value = "admin")]
        owner: String,
        /// Display name.
        #[arg(long)]
        displayname: Option<String>,
    },
    /// List spaces.
    List,
}

fn parse_resource_type(s: &str) -> Result<ResourceType, String> {
    s.parse::<ResourceType>().map_err(|e| e.to_string())
}

fn parse_query_type(s: &str) -> Result<QueryType, String> {
    match s {
        "subpath" => Ok(QueryType::Subpath),
        "search" => Ok(QueryType::Search),
        "spaces" => Ok(QueryType::Spaces),
        other => Err(format!(
            "unknown query type '{}'. Use subpath, search, or spaces.",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging);

    if let Err(err) = run(cli.command, &cfg).await {
        match err.downcast_ref::<StoreError>() {
            Some(store_err) => {
                let payload = serde_json::to_string(&store_err.payload())?;
                eprintln!("{}", payload);
            }
            None => eprintln!("Error: {:#}", err),
        }
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_index(cfg: &Config) -> Result<Option<SearchIndex>> {
    if !cfg.index.enabled {
        return Ok(None);
    }
    Ok(Some(SearchIndex::open(&cfg.index.path).await?))
}

/// Push a successful write to the index. Index failures never undo the
/// write; `strata reindex` repairs a stale index.
async fn sync_upsert(index: Option<&SearchIndex>, space: &str, subpath: &str, meta: &Meta) {
    if let Some(index) = index {
        if let Err(err) = index.upsert(space, subpath, meta).await {
            tracing::warn!(error = %err, shortname = %meta.shortname, "index sync failed");
        }
    }
}

async fn sync_remove(index: Option<&SearchIndex>, space: &str, subpath: &str, meta: &Meta) {
    if let Some(index) = index {
        if let Err(err) = index.remove(space, subpath, meta).await {
            tracing::warn!(error = %err, shortname = %meta.shortname, "index removal failed");
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_query(
    cfg: &Config,
    query_type: QueryType,
    space: &str,
    subpath: &str,
    filters: Filters,
) -> Query {
    let mut query = Query::new(query_type, space, subpath);
    query.filter_types = filters.filter_types.into_iter().collect();
    query.filter_shortnames = filters.filter_shortnames.into_iter().collect();
    query.offset = filters.offset;
    query.limit = filters.limit.unwrap_or(cfg.query.default_limit);
    query
}

async fn run(command: Commands, cfg: &Config) -> Result<()> {
    let store = MetadataStore::from_config(cfg);

    match command {
        Commands::Init => {
            std::fs::create_dir_all(&cfg.storage.spaces_root).with_context(|| {
                format!(
                    "Failed to create spaces root: {}",
                    cfg.storage.spaces_root.display()
                )
            })?;
            let index = open_index(cfg).await?;
            println!(
                "strata initialized: spaces at {}",
                cfg.storage.spaces_root.display()
            );
            if let Some(index) = index {
                println!("search index at {}", cfg.index.path.display());
                index.close().await;
            }
        }

        Commands::Space { action } => match action {
            SpaceAction::Create {
                name,
                owner,
                displayname,
            } => {
                let mut meta = Meta::new(ResourceType::Space, &name, &owner);
                meta.displayname = displayname;
                store.create_space(&meta)?;
                let index = open_index(cfg).await?;
                sync_upsert(index.as_ref(), &name, "", &meta).await;
                print_json(&meta.to_record("", &[]))?;
            }
            SpaceAction::List => {
                let engine = QueryEngine::from_config(cfg, None);
                let mut query = Query::new(QueryType::Spaces, "", "/");
                query.limit = cfg.query.max_limit;
                print_json(&engine.serve_query(&query).await?)?;
            }
        },

        Commands::Create {
            target,
            fields,
            owner,
        } => {
            let mut meta = Meta::new(target.resource_type, &target.shortname, &owner);
            meta.displayname = fields.displayname;
            meta.description = fields.description;
            meta.tags = fields.tags.into_iter().collect();
            store.create(&target.space, &target.subpath, &meta)?;

            let index = open_index(cfg).await?;
            sync_upsert(index.as_ref(), &target.space, &target.subpath, &meta).await;
            print_json(&meta.to_record(&target.subpath, &[]))?;
        }

        Commands::Get { target } => {
            let meta = load_target(&store, &target)?;
            print_json(&meta.to_record(&target.subpath, &[]))?;
        }

        Commands::Update {
            target,
            fields,
            active,
        } => {
            let mut meta = load_target(&store, &target)?;
            if let Some(displayname) = fields.displayname {
                meta.displayname = Some(displayname);
            }
            if let Some(description) = fields.description {
                meta.description = Some(description);
            }
            if !fields.tags.is_empty() {
                meta.tags = fields.tags.into_iter().collect::<BTreeSet<_>>();
            }
            if let Some(active) = active {
                meta.is_active = active;
            }
            meta.updated_at = Utc::now();
            store.update(&target.space, &target.subpath, &meta)?;

            let index = open_index(cfg).await?;
            sync_upsert(index.as_ref(), &target.space, &target.subpath, &meta).await;
            print_json(&meta.to_record(&target.subpath, &[]))?;
        }

        Commands::Delete { target } => {
            let meta = load_target(&store, &target)?;
            store.delete(&target.space, &target.subpath, &meta)?;

            let index = open_index(cfg).await?;
            sync_remove(index.as_ref(), &target.space, &target.subpath, &meta).await;
            print_json(&meta.to_record(&target.subpath, &[]))?;
        }

        Commands::Move {
            target,
            to_subpath,
            to_shortname,
        } => {
            let mut meta = load_target(&store, &target)?;
            let before = meta.clone();
            store.move_entry(
                &target.space,
                &target.subpath,
                &target.shortname,
                to_subpath.as_deref(),
                to_shortname.as_deref(),
                &mut meta,
            )?;

            let dst_subpath = to_subpath.as_deref().unwrap_or(target.subpath.as_str());
            let index = open_index(cfg).await?;
            sync_remove(index.as_ref(), &target.space, &target.subpath, &before).await;
            sync_upsert(index.as_ref(), &target.space, dst_subpath, &meta).await;
            if meta.resource_type == ResourceType::Folder && index.is_some() {
                tracing::info!("folder moved; run `strata reindex` to refresh entries below it");
            }
            print_json(&meta.to_record(dst_subpath, &[]))?;
        }

        Commands::Upload {
            target,
            file,
            content_type,
        } => {
            let mut meta = load_target(&store, &target)?;
            let content_type = match content_type {
                Some(ct) => parse_content_type(&ct)?,
                None => guess_content_type(&file),
            };
            let uploaded_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let reader = File::open(&file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let body =
                store.save_payload(&target.space, &target.subpath, &meta, &uploaded_name, reader)?;

            meta.payload = Some(Payload {
                content_type,
                schema_shortname: None,
                body,
            });
            meta.updated_at = Utc::now();
            store.update(&target.space, &target.subpath, &meta)?;

            let index = open_index(cfg).await?;
            sync_upsert(index.as_ref(), &target.space, &target.subpath, &meta).await;
            print_json(&meta.to_record(&target.subpath, &[]))?;
        }

        Commands::AttachJson {
            target,
            file,
            schema,
        } => {
            let mut meta = load_target(&store, &target)?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let data: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            let body = store.save_payload_from_json(&target.space, &target.subpath, &meta, &data)?;

            meta.payload = Some(Payload {
                content_type: ContentType::Json,
                schema_shortname: schema,
                body,
            });
            meta.updated_at = Utc::now();
            store.update(&target.space, &target.subpath, &meta)?;

            let index = open_index(cfg).await?;
            sync_upsert(index.as_ref(), &target.space, &target.subpath, &meta).await;
            print_json(&meta.to_record(&target.subpath, &[]))?;
        }

        Commands::Query {
            space,
            subpath,
            query_type,
            search,
            filter_tags,
            include_fields,
            payload,
            filters,
        } => {
            let mut query = build_query(cfg, query_type, &space, &subpath, filters);
            query.search_text = search;
            query.filter_tags = filter_tags.into_iter().collect();
            query.include_fields = include_fields;
            query.retrieve_json_payload = payload;

            let index = if query_type == QueryType::Search {
                open_index(cfg).await?
            } else {
                None
            };
            let engine = QueryEngine::from_config(cfg, index);
            print_json(&engine.serve_query(&query).await?)?;
        }

        Commands::Locators {
            space,
            subpath,
            filters,
        } => {
            let query = build_query(cfg, QueryType::Subpath, &space, &subpath, filters);
            let engine = QueryEngine::from_config(cfg, None);
            print_json(&engine.locators_query(&query)?)?;
        }

        Commands::Reindex => {
            let Some(index) = open_index(cfg).await? else {
                bail!("The search index is disabled. Set [index] enabled = true in config.");
            };
            let stats = sync::reindex(&store, &index).await?;
            println!("indexed documents: {}", stats.indexed);
            println!("skipped files: {}", stats.skipped);
            println!("ok");
            index.close().await;
        }
    }

    Ok(())
}

fn load_target(store: &MetadataStore, target: &Target) -> strata::Result<Meta> {
    store.load(
        &target.space,
        &target.subpath,
        &target.shortname,
        target.resource_type,
    )
}

fn parse_content_type(s: &str) -> Result<ContentType> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("Unknown content type: '{}'", s))
}

fn guess_content_type(file: &Path) -> ContentType {
    file.extension()
        .and_then(|e| e.to_str())
        .and_then(ContentType::from_extension)
        .unwrap_or(ContentType::Text)
}
