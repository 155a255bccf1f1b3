use anyhow::{Context, Result};
use clap::Parser;
use ogc_generic_reader::{DriverRegistry, GenericReader, ReaderConfig, Values};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reader configuration (database descriptor and query catalog)
    #[arg(short, long, value_name = "XML")]
    config: PathBuf,

    /// Variable to load (repeatable)
    #[arg(short, long = "var", value_name = "NAME")]
    vars: Vec<String>,

    /// Positional query parameter (repeatable, in placeholder order)
    #[arg(short, long = "param", value_name = "VALUE")]
    params: Vec<String>,

    /// Run statements on the worker pool
    #[arg(long)]
    parallel: bool,

    /// Worker pool size
    #[arg(short, long)]
    threads: Option<usize>,

    /// Maximum number of statements in flight
    #[arg(long)]
    window: Option<usize>,

    /// List the variables the configuration can resolve and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let start_time = std::time::Instant::now();

    let mut config = ReaderConfig::from_path(&args.config)
        .with_context(|| format!("Failed to load configuration {:?}", args.config))?;
    if args.parallel {
        config.options.parallel = true;
    }
    if let Some(threads) = args.threads {
        anyhow::ensure!(threads > 0, "--threads must be positive");
        config.options.max_threads = threads;
    }
    if let Some(window) = args.window {
        anyhow::ensure!(window > 0, "--window must be positive");
        config.options.window = window;
    }

    let registry = DriverRegistry::with_builtin();
    let reader = GenericReader::new(&config, &registry).context("Failed to start the reader")?;

    for failure in reader.compile_failures() {
        error!("{}", failure);
    }

    if args.list {
        for name in reader.variable_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    if args.vars.is_empty() {
        error!("No variables requested");
        anyhow::bail!("Use --var to request at least one variable (or --list)");
    }

    let values = reader.load_data_with(&args.vars, &args.params)?;
    print_values(&args.vars, &values);

    let elapsed = start_time.elapsed();
    info!("Total processing time: {:?}", elapsed);

    Ok(())
}

fn print_values(requested: &[String], values: &Values) {
    for name in requested {
        for value in values.get_variables(name) {
            println!("{} = {}", name, value);
        }
    }
}
