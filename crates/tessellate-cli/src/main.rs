use anyhow::{Context, bail};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tessellate_graph::{
    DocumentFormat, DocumentStore, FinalizeConfig, FsDocumentStore, finalize, load_document,
    render_document, validate,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "tessellate_cli=info,tessellate_graph=info";

#[derive(Parser, Debug)]
#[command(name = "tessellate")]
#[command(about = "Finalize scatter/gather CWL pipeline documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Splice the stage-out, split and merge stages into a base document.
    Finalize(FinalizeArgs),
    /// Check a document and print its diagnostics.
    Validate(ValidateArgs),
    /// Print the step dependency edges of a document.
    Edges(EdgesArgs),
}

#[derive(clap::Args, Debug)]
struct FinalizeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    container: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct EdgesArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

impl From<OutputFormat> for DocumentFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Yaml => Self::Yaml,
            OutputFormat::Json => Self::Json,
        }
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Finalize(args) => finalize_command(args),
        Commands::Validate(args) => validate_command(args),
        Commands::Edges(args) => edges_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

fn finalize_command(args: FinalizeArgs) -> anyhow::Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => FinalizeConfig::default(),
    };
    if let Some(image) = args.container {
        config = config.with_container(image);
    }

    tracing::debug!(
        input = %args.input.display(),
        container = %config.templates.container.docker_pull,
        "finalizing document"
    );
    let (store, key) = open_store(&args.input)?;
    let document = load_document(&store, &key)
        .with_context(|| format!("failed to load {}", args.input.display()))?;
    let finalized = finalize(&document, &config)?;

    match &args.output {
        Some(output) => {
            let format = args
                .format
                .map(DocumentFormat::from)
                .unwrap_or_else(|| DocumentFormat::from_path(output));
            let rendered = render_document(&finalized.document, format)?;
            let (target, target_key) = create_store(output)?;
            target
                .write(&target_key, &rendered)
                .with_context(|| format!("failed to write {}", output.display()))?;
        }
        None => {
            let format = args.format.map(DocumentFormat::from).unwrap_or_default();
            print!("{}", render_document(&finalized.document, format)?);
        }
    }

    eprintln!("{}", finalized.report);
    Ok(ExitCode::SUCCESS)
}

fn validate_command(args: ValidateArgs) -> anyhow::Result<ExitCode> {
    let (store, key) = open_store(&args.input)?;
    let document = load_document(&store, &key)
        .with_context(|| format!("failed to load {}", args.input.display()))?;
    let diagnostics = validate(&document, &[]);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else if diagnostics.is_empty() {
        println!("ok: {} node(s), no diagnostics", document.len());
    } else {
        for diagnostic in &diagnostics {
            println!("{diagnostic}");
            if let Some(fix) = &diagnostic.fix {
                println!("  fix: {fix}");
            }
        }
    }

    if diagnostics.iter().any(|diagnostic| diagnostic.is_error()) {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn edges_command(args: EdgesArgs) -> anyhow::Result<ExitCode> {
    let (store, key) = open_store(&args.input)?;
    let document = load_document(&store, &key)
        .with_context(|| format!("failed to load {}", args.input.display()))?;
    for (from, to) in document.dependency_edges() {
        println!("{from} -> {to}");
    }
    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &Path) -> anyhow::Result<FinalizeConfig> {
    let (store, key) = open_store(path)?;
    let source = store
        .read(&key)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Ok(FinalizeConfig::parse(&source, DocumentFormat::from_path(path))?)
}

/// A read-only store over the file's existing directory, plus the file's key.
fn open_store(path: &Path) -> anyhow::Result<(FsDocumentStore, String)> {
    let (root, key) = split_path(path)?;
    let store = FsDocumentStore::open(&root)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok((store, key))
}

/// Like [`open_store`], creating the file's directory when missing.
fn create_store(path: &Path) -> anyhow::Result<(FsDocumentStore, String)> {
    let (root, key) = split_path(path)?;
    Ok((FsDocumentStore::new(root)?, key))
}

fn split_path(path: &Path) -> anyhow::Result<(PathBuf, String)> {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("{} does not name a file", path.display());
    };
    let root = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((root, name.to_string()))
}
