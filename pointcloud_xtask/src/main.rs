use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pointcloud_store::{
    BoundingBox, FilterMode, PointCloudStore, SchemaVersion, ViewArena, load_or_init_config,
    open_store,
};
use serde::Serialize;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect(args) => inspect(args),
        Command::Hash(args) => print_hash(args),
        Command::Migrate(args) => migrate(args),
        Command::Export(args) => export(args),
        Command::Values(args) => value_counts(args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Developer utilities for point-cloud stores")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize a store: size, bounds, objects, attributes and schema.
    Inspect(StoreArgs),
    /// Print the content hash of a store.
    Hash(StoreArgs),
    /// Upgrade a store to the latest schema.
    Migrate(StoreArgs),
    /// Copy a store to a standalone sqlite file.
    Export(ExportArgs),
    /// Count the values of one attribute, optionally within a metadata filter.
    Values(ValuesArgs),
}

#[derive(Parser)]
struct StoreArgs {
    /// Directory holding pointcloud.json and the sqlite file.
    #[arg(long, default_value = ".pointcloud")]
    datastore: PathBuf,
}

#[derive(Parser)]
struct ExportArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Destination sqlite file.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Parser)]
struct ValuesArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Attribute whose values are counted.
    #[arg(long)]
    key: String,
    /// Restrict to points matching `name=value`; repeat to intersect.
    #[arg(long = "filter")]
    filters: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreSummary {
    backend: &'static str,
    schema: SchemaVersion,
    points: i64,
    bounds: Option<BoundingBox>,
    objects: Vec<String>,
    attributes: Vec<String>,
    hash: String,
}

fn open(args: &StoreArgs) -> Result<PointCloudStore> {
    open_store(&args.datastore)
        .with_context(|| format!("open store in {}", args.datastore.display()))
}

fn inspect(args: StoreArgs) -> Result<()> {
    let config = load_or_init_config(&args.datastore)?;
    let store = open(&args)?;
    let summary = StoreSummary {
        backend: config.backend_name(),
        schema: store.schema_version()?,
        points: store.count()?,
        bounds: store.bounds()?,
        objects: store.loaded_objects()?,
        attributes: store.metadata_attribute_names()?,
        hash: store.hash()?.to_hex(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn print_hash(args: StoreArgs) -> Result<()> {
    let store = open(&args)?;
    println!("{}", store.hash()?);
    Ok(())
}

fn migrate(args: StoreArgs) -> Result<()> {
    let store = open(&args)?;
    let applied = store.migrate()?;
    if applied.is_empty() {
        println!("Store already at schema {:?}", store.schema_version()?);
        return Ok(());
    }
    for step in &applied {
        println!("applied {step}");
    }
    log::info!("pointcloud xtask: migrated {}", args.datastore.display());
    Ok(())
}

fn export(args: ExportArgs) -> Result<()> {
    let store = open(&args.store)?;
    if args.out.exists() {
        bail!("refusing to overwrite {}", args.out.display());
    }
    store.save_to_disk(&args.out)?;
    println!("Wrote {} points to {}", store.count()?, args.out.display());
    Ok(())
}

fn value_counts(args: ValuesArgs) -> Result<()> {
    let store = open(&args.store)?;
    let mut views = ViewArena::new();
    let view = views.create_view();
    for filter in &args.filters {
        let Some((name, value)) = filter.split_once('=') else {
            bail!("filter '{filter}' must look like name=value");
        };
        views.filter_on_metadata(view, name, value, FilterMode::Or)?;
    }
    let counts: BTreeMap<String, i64> = views.attribute_value_counts(&store, view, &args.key)?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}
