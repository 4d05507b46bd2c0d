use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use relata_core::{EntityRegistry, SchemaModel, Table};
use relata_sqlite::{CommandBuilder, ContextConfig, DbContext, SqliteDialect};

/// Output format for `inspect`.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliOutputFormat {
    Json,
    Yaml,
}

#[derive(Debug, Parser)]
#[command(name = "relata")]
#[command(about = "Inspect inferred relational schemas and create them in SQLite", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the SQLite DDL for a model file.
    Ddl(DdlArgs),
    /// Print the inferred tables, keys and relationships.
    Inspect(InspectArgs),
    /// Create the schema of a model file in a database.
    Create(CreateArgs),
    /// Write a context configuration file with default settings.
    InitConfig(InitConfigArgs),
}

#[derive(Debug, Args)]
struct DdlArgs {
    /// Entity model file (YAML, or JSON with a .json extension).
    models: PathBuf,
    /// Include DROP TABLE statements.
    #[arg(long)]
    drop: bool,
    /// Context configuration supplying custom type mappings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InspectArgs {
    /// Entity model file (YAML, or JSON with a .json extension).
    models: PathBuf,
    /// Output format.
    #[arg(long, default_value = "json")]
    format: CliOutputFormat,
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Entity model file (YAML, or JSON with a .json extension).
    models: PathBuf,
    /// Context configuration file.
    #[arg(long, conflicts_with = "db")]
    config: Option<PathBuf>,
    /// Database file path, used with default settings.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InitConfigArgs {
    /// Where to write the configuration.
    output: PathBuf,
    /// Database file path recorded in the configuration.
    #[arg(long)]
    db: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Ddl(args) => run_ddl(args),
        Command::Inspect(args) => run_inspect(args),
        Command::Create(args) => run_create(args),
        Command::InitConfig(args) => run_init_config(args),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn load_registry(path: &Path) -> Result<EntityRegistry, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read models '{}': {e}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        EntityRegistry::from_json(&text).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&text)
            .map_err(|e| format!("Failed to parse models '{}': {e}", path.display()))
    }
}

fn load_config(path: &Path) -> Result<ContextConfig, String> {
    ContextConfig::load(path)
        .map_err(|e| format!("Failed to load config '{}': {e}", path.display()))
}

/// Builds every registered entity and returns the model with the names of
/// all reachable tables, junctions included.
fn build_schema(registry: EntityRegistry) -> Result<(SchemaModel, Vec<String>), String> {
    let entities: Vec<String> = registry.names().map(String::from).collect();
    let refs: Vec<&str> = entities.iter().map(String::as_str).collect();
    let mut schema = SchemaModel::new(registry);
    let names: Vec<String> = schema
        .closure(&refs)
        .map_err(|e| format!("Schema inference failed: {e}"))?
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    Ok((schema, names))
}

fn run_ddl(args: DdlArgs) -> Result<(), String> {
    let registry = load_registry(&args.models)?;
    let dialect = match &args.config {
        Some(path) => SqliteDialect::with_custom_types(load_config(path)?.custom_types),
        None => SqliteDialect::new(),
    };
    let (schema, names) = build_schema(registry)?;
    let tables: Vec<&Table> = names.iter().filter_map(|n| schema.table(n)).collect();
    let ddl = CommandBuilder::new(&dialect, &schema)
        .ensure_created(&tables)
        .map_err(|e| format!("DDL generation failed: {e}"))?;
    print!("{}", ddl.to_script(args.drop));
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<(), String> {
    let registry = load_registry(&args.models)?;
    let (schema, names) = build_schema(registry)?;
    let tables: Vec<&Table> = names.iter().filter_map(|n| schema.table(n)).collect();
    let rendered = match args.format {
        CliOutputFormat::Json => serde_json::to_string_pretty(&tables)
            .map_err(|e| format!("Failed to render JSON: {e}"))?,
        CliOutputFormat::Yaml => {
            serde_yaml::to_string(&tables).map_err(|e| format!("Failed to render YAML: {e}"))?
        }
    };
    println!("{rendered}");
    Ok(())
}

fn run_create(args: CreateArgs) -> Result<(), String> {
    let registry = load_registry(&args.models)?;
    let config = match (&args.config, &args.db) {
        (Some(path), _) => load_config(path)?,
        (None, Some(db)) => ContextConfig::for_path(db),
        (None, None) => return Err("either --config or --db is required".to_string()),
    };
    let count = registry.len();
    let mut ctx = DbContext::open(&config, registry)
        .map_err(|e| format!("Failed to open database '{}': {e}", config.database))?;
    ctx.ensure_created()
        .map_err(|e| format!("Schema creation failed: {e}"))?;
    let tables = ctx.schema().tables().count();
    println!(
        "Schema created: {tables} tables for {count} entities in '{}'.",
        config.database
    );
    Ok(())
}

fn run_init_config(args: InitConfigArgs) -> Result<(), String> {
    let config = ContextConfig::for_path(&args.db);
    config
        .save(&args.output)
        .map_err(|e| format!("Failed to write config '{}': {e}", args.output.display()))?;
    println!("Config written to '{}'.", args.output.display());
    Ok(())
}
