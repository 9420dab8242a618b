use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use testflow::{Compiler, CompilerConfig, Stage};
use tracing::{debug, error, trace};

/// Compile workflow stage trees into containers and action tapes
#[derive(Parser)]
#[command(name = "testflow")]
#[command(about = "Compile workflow stages into containers and action plans", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a stage tree into container specifications with their actions
    Compile {
        /// Stage tree in YAML or JSON
        file: PathBuf,

        /// Path to configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Never merge the setup step into the first container
        #[arg(long)]
        isolated: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Print the optimized action plan in compact form
    Plan {
        /// Stage tree in YAML or JSON
        file: PathBuf,

        /// Path to configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Print the finalized per-container groups instead of one list
        #[arg(long)]
        grouped: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("testflow started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Commands::Compile {
            file,
            config,
            isolated,
            format,
        } => run_compile(&file, config.as_deref(), isolated, format),
        Commands::Plan {
            file,
            config,
            grouped,
        } => run_plan(&file, config.as_deref(), grouped),
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CompilerConfig> {
    match path {
        Some(path) => CompilerConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let mut config = CompilerConfig::default();
            config.merge_env_vars()?;
            Ok(config)
        }
    }
}

fn load_stage(path: &Path) -> anyhow::Result<Stage> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let stage = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(stage)
}

fn run_compile(
    file: &Path,
    config: Option<&Path>,
    isolated: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut config = load_config(config)?;
    config.isolated_containers |= isolated;
    let stage = load_stage(file)?;

    let workflow = Compiler::new(config)
        .compile(&stage)
        .with_context(|| format!("Failed to compile {}", file.display()))?;
    let output = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&workflow)?,
        OutputFormat::Yaml => serde_yaml::to_string(&workflow)?,
    };
    println!("{output}");
    Ok(())
}

fn run_plan(file: &Path, config: Option<&Path>, grouped: bool) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let stage = load_stage(file)?;
    let compiler = Compiler::new(config);

    let output = if grouped {
        serde_json::to_string(&compiler.plan(&stage)?)?
    } else {
        serde_json::to_string(&compiler.compile_actions(&stage)?)?
    };
    println!("{output}");
    Ok(())
}
