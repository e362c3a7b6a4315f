use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use sipcheck::config::{Deployment, RunnerConfig};
use sipcheck::definition::Environment;
use sipcheck::endpoint::wire::WireClient;
use sipcheck::provision::http::HttpProvisioner;
use sipcheck::provision::memory::MemoryProvisioner;
use sipcheck::provision::Provisioner;
use sipcheck::stats::HttpStatsSource;
use sipcheck::{catalog, report};

#[derive(Parser)]
#[command(
    name = "sipcheck",
    about = "Live call-flow tests for SIP/IMS deployments",
    version,
    long_about = None
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the selected tests against a deployment
    Run(RunArgs),

    /// List test names matching a glob
    List {
        /// Name glob (`*` and `?`)
        #[arg(default_value = "*")]
        pattern: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Home domain of the deployment under test
    domain: String,

    /// Name glob selecting tests
    #[arg(default_value = "*")]
    pattern: String,

    /// Deployment settings file (TOML)
    #[arg(long)]
    deployment: Option<PathBuf>,

    /// Signalling proxy / registrar, host:port
    #[arg(long)]
    proxy: Option<String>,

    /// Directory for failure artifacts
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    /// Times to run the whole selection
    #[arg(long, env = "REPEAT", default_value = "1")]
    repeat: u32,

    /// Transports, comma-separated (tcp, udp)
    #[arg(long, env = "TRANSPORT", value_delimiter = ',', default_value = "tcp")]
    transport: Vec<String>,

    /// Name prefixes of "<test> (<TRANSPORT>)" runs to skip, comma-separated
    #[arg(long, env = "EXCLUDE_TESTS", value_delimiter = ',')]
    exclude: Vec<String>,

    /// Check latency statistics after each passing test
    #[arg(long, env = "STATS_CHECK")]
    stats_check: bool,

    /// Write a JSON report to this path
    #[arg(long)]
    json: Option<PathBuf>,
}

const EXIT_FAILURES: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::List { pattern } => {
            let registry = catalog::registry()?;
            for test in registry.select(&pattern) {
                println!("{}", test.name());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    // Configuration problems end the run before any test executes.
    let config = match RunnerConfig::from_raw(
        args.repeat,
        &args.transport,
        &args.exclude,
        args.stats_check,
    ) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let mut deployment = match &args.deployment {
        Some(path) => match Deployment::load(path) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("configuration error: {}", e);
                return Ok(ExitCode::from(EXIT_CONFIG));
            }
        },
        None => Deployment::default(),
    };
    deployment.domain = args.domain.clone();
    if let Some(proxy) = args.proxy {
        deployment.proxy = Some(proxy);
    }
    if let Some(dir) = args.artifact_dir {
        deployment.artifact_dir = dir;
    }
    if let Err(e) = deployment.validate(&config) {
        eprintln!("configuration error: {}", e);
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    let env = Arc::new(environment(deployment, config.stats_check)?);
    let registry = catalog::registry()?;

    tracing::info!(domain = %args.domain, pattern = %args.pattern, "sipcheck starting");
    let summary = registry
        .run_all(&env, &config, &args.pattern, report::print_record)
        .await;
    report::print_totals(&summary);

    if let Some(path) = &args.json {
        report::write_json(&summary, path)?;
    }

    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURES)
    })
}

fn environment(deployment: Deployment, stats_check: bool) -> Result<Environment> {
    let provisioner: Arc<dyn Provisioner> = match &deployment.provisioning_url {
        Some(url) => Arc::new(
            HttpProvisioner::new(url, &deployment.domain, deployment.provisioning_key.clone())
                .context("building provisioning client")?,
        ),
        None => {
            tracing::warn!("no provisioning_url configured, minting identities locally");
            Arc::new(MemoryProvisioner::new(&deployment.domain))
        }
    };
    let stats = match &deployment.stats_url {
        Some(url) => Some(Arc::new(HttpStatsSource::new(url)?)),
        None => None,
    };

    let mut env = Environment::new(deployment, provisioner)
        .with_signalling(Arc::new(WireClient))
        .with_stats_check(stats_check);
    if let Some(stats) = stats {
        env = env.with_stats(stats);
    }
    Ok(env)
}
