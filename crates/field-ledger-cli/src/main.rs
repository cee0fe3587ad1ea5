use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use field_ledger_core::{
    validate, EntryId, EntryInput, EntryStatus, Kind, QueryFilters, Scope, Section,
};
use field_ledger_store::{
    DateRange, ExportFilters, ImportStrategy, Ledger, LedgerConfig,
};
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "fl.v1";

#[derive(Debug, Parser)]
#[command(name = "fl")]
#[command(about = "FieldLedger: durable knowledge store for coding agents")]
struct Cli {
    /// Project root the store is bound to.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Storage sub-path under the root.
    #[arg(long, default_value = ".field-ledger")]
    storage_dir: PathBuf,

    /// External tracking command probed for the primary backend.
    #[arg(long, default_value = "tracker")]
    tracker: String,

    /// Skip the tracker probe and manage the record file directly.
    #[arg(long, default_value_t = false)]
    no_tracker: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the storage directory and empty store files.
    Init,
    /// Validate, scan, and persist a new entry.
    Create(CreateArgs),
    /// Fetch one entry by id.
    Get(IdArg),
    /// Ranked, scope-aware query over the store.
    Query(QueryArgs),
    /// Resolve an entry's related references.
    Related(IdArg),
    /// Retire an entry behind a new replacement.
    Supersede(SupersedeArgs),
    /// Flip an entry to deprecated.
    Deprecate(IdArg),
    /// Dump entries as line-delimited JSON.
    Export(ExportArgs),
    /// Load a line-delimited dump, resolving id collisions.
    Import(ImportArgs),
    /// Statistics snapshot, cached for five minutes.
    Stats(StatsArgs),
    /// Write the grouped Markdown context digest.
    SyncContext,
    /// Ask the tracker backend to compact its log.
    Consolidate,
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Entry input as JSON; `-` reads stdin.
    #[arg(long)]
    json: String,
}

#[derive(Debug, Args)]
struct IdArg {
    id: String,
}

#[derive(Debug, Args)]
struct SupersedeArgs {
    id: String,
    /// Replacement entry input as JSON; `-` reads stdin.
    #[arg(long)]
    json: String,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long = "section")]
    sections: Vec<String>,
    #[arg(long = "kind")]
    kinds: Vec<String>,
    #[arg(long = "scope")]
    scopes: Vec<String>,
    #[arg(long = "subject")]
    subjects: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "status")]
    statuses: Vec<String>,
    #[arg(long)]
    min_confidence: Option<f32>,
    #[arg(long)]
    max_confidence: Option<f32>,
    #[arg(long)]
    created_after: Option<String>,
    #[arg(long)]
    created_before: Option<String>,
    #[arg(long)]
    updated_after: Option<String>,
    #[arg(long)]
    updated_before: Option<String>,
    #[arg(long, default_value_t = false)]
    summary_only: bool,
    #[arg(long, default_value_t = false)]
    include_related: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long = "section")]
    sections: Vec<String>,
    #[arg(long)]
    min_confidence: Option<f32>,
    #[arg(long)]
    created_after: Option<String>,
    #[arg(long)]
    created_before: Option<String>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// skip | overwrite | merge
    #[arg(long, default_value = "skip")]
    strategy: String,
}

#[derive(Debug, Args)]
struct StatsArgs {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    /// Recompute even when a cached snapshot is fresh.
    #[arg(long, default_value_t = false)]
    no_cache: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = LedgerConfig {
        enabled: true,
        storage_dir: cli.storage_dir.clone(),
        tracker_command: if cli.no_tracker { None } else { Some(cli.tracker.clone()) },
    };
    let mut ledger = Ledger::open(&cli.root, config)?;

    match cli.command {
        Command::Init => run_init(&ledger),
        Command::Create(args) => run_create(&args, &mut ledger),
        Command::Get(args) => run_get(&args, &ledger),
        Command::Query(args) => run_query(&args, &mut ledger),
        Command::Related(args) => run_related(&args, &ledger),
        Command::Supersede(args) => run_supersede(&args, &mut ledger),
        Command::Deprecate(args) => run_deprecate(&args, &mut ledger),
        Command::Export(args) => run_export(&args, &ledger),
        Command::Import(args) => run_import(&args, &mut ledger),
        Command::Stats(args) => run_stats(&args, &mut ledger),
        Command::SyncContext => run_sync_context(&ledger),
        Command::Consolidate => run_consolidate(&mut ledger),
    }
}

fn run_init(ledger: &Ledger) -> Result<()> {
    ledger.init()?;
    emit_json(serde_json::json!({
        "initialized": true,
        "backend": ledger.backend_name(),
        "root": ledger.root()
    }))
}

fn run_create(args: &CreateArgs, ledger: &mut Ledger) -> Result<()> {
    let input = parse_entry_input(&args.json)?;
    let warnings = validate(&input).warnings;
    let id = ledger.create(&input)?;
    emit_json(serde_json::json!({
        "id": id.to_string(),
        "warnings": warnings
    }))
}

fn run_get(args: &IdArg, ledger: &Ledger) -> Result<()> {
    let id = parse_entry_id(&args.id)?;
    let entry = ledger.get(&id)?;
    emit_json(serde_json::json!({ "entry": entry }))
}

fn run_query(args: &QueryArgs, ledger: &mut Ledger) -> Result<()> {
    let filters = build_query_filters(args)?;
    let items = ledger.query(&filters)?;
    emit_json(serde_json::json!({
        "count": items.len(),
        "items": items
    }))
}

fn run_related(args: &IdArg, ledger: &Ledger) -> Result<()> {
    let id = parse_entry_id(&args.id)?;
    let related = ledger.get_related(&id)?;
    emit_json(serde_json::json!({
        "id": args.id,
        "related": related
    }))
}

fn run_supersede(args: &SupersedeArgs, ledger: &mut Ledger) -> Result<()> {
    let id = parse_entry_id(&args.id)?;
    let input = parse_entry_input(&args.json)?;
    let replacement = ledger.supersede(&id, &input)?;
    emit_json(serde_json::json!({
        "id": args.id,
        "replacement_id": replacement.to_string()
    }))
}

fn run_deprecate(args: &IdArg, ledger: &mut Ledger) -> Result<()> {
    let id = parse_entry_id(&args.id)?;
    ledger.deprecate(&id)?;
    emit_json(serde_json::json!({
        "id": args.id,
        "status": "deprecated"
    }))
}

fn run_export(args: &ExportArgs, ledger: &Ledger) -> Result<()> {
    let filters = ExportFilters {
        sections: parse_sections(&args.sections)?,
        min_confidence: args.min_confidence,
        created_after: parse_optional_rfc3339(args.created_after.as_deref())?,
        created_before: parse_optional_rfc3339(args.created_before.as_deref())?,
    };
    let exported = ledger.export(&args.out, &filters)?;
    emit_json(serde_json::json!({
        "out": args.out,
        "exported": exported
    }))
}

fn run_import(args: &ImportArgs, ledger: &mut Ledger) -> Result<()> {
    let strategy = ImportStrategy::parse(&args.strategy)
        .ok_or_else(|| anyhow!("strategy MUST be one of skip|overwrite|merge (got '{}')", args.strategy))?;
    let report = ledger.import(&args.input, strategy)?;
    emit_json(serde_json::json!({
        "in": args.input,
        "strategy": strategy.as_str(),
        "report": report
    }))
}

fn run_stats(args: &StatsArgs, ledger: &mut Ledger) -> Result<()> {
    let range = DateRange {
        from: parse_optional_rfc3339(args.from.as_deref())?,
        to: parse_optional_rfc3339(args.to.as_deref())?,
    };
    let snapshot = ledger.statistics(range, args.no_cache)?;
    emit_json(serde_json::json!({ "snapshot": snapshot }))
}

fn run_sync_context(ledger: &Ledger) -> Result<()> {
    let path = ledger.sync_context()?;
    emit_json(serde_json::json!({ "path": path }))
}

fn run_consolidate(ledger: &mut Ledger) -> Result<()> {
    let delegated = ledger.consolidate()?;
    emit_json(serde_json::json!({ "delegated": delegated }))
}

fn build_query_filters(args: &QueryArgs) -> Result<QueryFilters> {
    Ok(QueryFilters {
        sections: parse_sections(&args.sections)?,
        kinds: args
            .kinds
            .iter()
            .map(|raw| Kind::parse(raw).ok_or_else(|| anyhow!("invalid kind: {raw}")))
            .collect::<Result<_>>()?,
        scopes: args
            .scopes
            .iter()
            .map(|raw| Scope::parse(raw).ok_or_else(|| anyhow!("invalid scope: {raw}")))
            .collect::<Result<_>>()?,
        subjects: args.subjects.clone(),
        tags: args.tags.clone(),
        statuses: args
            .statuses
            .iter()
            .map(|raw| EntryStatus::parse(raw).ok_or_else(|| anyhow!("invalid status: {raw}")))
            .collect::<Result<_>>()?,
        min_confidence: args.min_confidence,
        max_confidence: args.max_confidence,
        created_after: parse_optional_rfc3339(args.created_after.as_deref())?,
        created_before: parse_optional_rfc3339(args.created_before.as_deref())?,
        updated_after: parse_optional_rfc3339(args.updated_after.as_deref())?,
        updated_before: parse_optional_rfc3339(args.updated_before.as_deref())?,
        summary_only: args.summary_only,
        include_related: args.include_related,
        limit: args.limit,
    })
}

fn parse_sections(raw: &[String]) -> Result<Vec<Section>> {
    raw.iter()
        .map(|value| Section::parse(value).ok_or_else(|| anyhow!("invalid section: {value}")))
        .collect()
}

fn parse_entry_input(raw: &str) -> Result<EntryInput> {
    let json = if raw == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read entry JSON from stdin")?;
        buffer
    } else {
        raw.to_string()
    };
    serde_json::from_str(&json).context("entry input is not valid JSON")
}

fn parse_entry_id(value: &str) -> Result<EntryId> {
    EntryId::parse(value).ok_or_else(|| anyhow!("invalid entry id: {value}"))
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value
        .map(|raw| {
            OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
                .with_context(|| format!("invalid RFC3339 timestamp: {raw}"))
        })
        .transpose()
}
