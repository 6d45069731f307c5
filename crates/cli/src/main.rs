use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use appset_core::{ApplicationSet, SyncPolicy, LAST_APPLIED_ANNOTATION};
use appset_engine::{
    duplicate_name, invalid_generators, AppGenerator, GeneratorRegistry, PlaceholderRenderer, ReconcileOutcome,
    Reconciler,
};
use appset_store::{AppStore, MemoryStore};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "appsetctl", version, about = "ApplicationSet expansion and reconcile CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PolicyArg { CreateOnly, CreateUpdate, Sync }

impl From<PolicyArg> for SyncPolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::CreateOnly => SyncPolicy::CreateOnly,
            PolicyArg::CreateUpdate => SyncPolicy::CreateUpdate,
            PolicyArg::Sync => SyncPolicy::Sync,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report unrecognized generators and duplicate application names
    Validate {
        /// ApplicationSet manifest (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print the Applications a set expands into, without touching any store
    Render {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Reconcile a set: in-memory for a file, against the cluster for --name
    Reconcile(ReconcileArgs),
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    /// Local manifest; reconciled into an in-process store
    #[arg(short = 'f', long = "file", conflicts_with = "name", required_unless_present = "name")]
    file: Option<PathBuf>,
    /// Live ApplicationSet name
    #[arg(long = "name", requires = "namespace")]
    name: Option<String>,
    #[arg(long = "ns")]
    namespace: Option<String>,
    /// Policy for sets that do not declare spec.syncPolicy
    #[arg(long = "policy", value_enum)]
    policy: Option<PolicyArg>,
    /// Run a single pass and exit
    #[arg(long = "once", action = ArgAction::SetTrue)]
    once: bool,
    /// Delay between passes when no generator asks for one
    #[arg(long = "requeue-secs", env = "APPSET_DEFAULT_REQUEUE_SECS", default_value_t = 180)]
    requeue_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("APPSET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APPSET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid APPSET_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parse a manifest. Without a last-applied annotation, the manifest itself is recorded
/// there so unknown generator names stay recoverable.
fn parse_set(raw: &str) -> Result<ApplicationSet> {
    let mut set: ApplicationSet = serde_yaml::from_str(raw).context("parsing ApplicationSet manifest")?;
    if set.last_applied_configuration().is_none() {
        let doc: serde_json::Value = serde_yaml::from_str(raw).context("parsing manifest as a document")?;
        set.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(LAST_APPLIED_ANNOTATION.to_string(), serde_json::to_string(&doc)?);
    }
    Ok(set)
}

fn load_set(path: &Path) -> Result<ApplicationSet> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_set(&raw)
}

fn app_generator() -> AppGenerator {
    AppGenerator::new(GeneratorRegistry::with_defaults(), Arc::new(PlaceholderRenderer::new()))
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce()) -> Result<()> {
    match output {
        Output::Human => human(),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateReport {
    name: String,
    has_invalid: bool,
    unrecognized: Vec<String>,
    duplicate: Option<String>,
    desired: usize,
    /// Why expansion stopped, when it did; duplicates are unknown in that case.
    #[serde(skip_serializing_if = "Option::is_none")]
    expansion_error: Option<String>,
}

impl ValidateReport {
    fn failed(&self) -> bool { self.duplicate.is_some() || self.expansion_error.is_some() }
}

async fn validate_report(set: &ApplicationSet) -> ValidateReport {
    let (has_invalid, names) = invalid_generators(set);
    let mut report = ValidateReport {
        name: set.name().to_string(),
        has_invalid,
        unrecognized: names.into_iter().collect(),
        duplicate: None,
        desired: 0,
        expansion_error: None,
    };
    match app_generator().generate_applications(set).await {
        Ok(desired) => {
            report.duplicate = duplicate_name(&desired).map(str::to_string);
            report.desired = desired.len();
        }
        Err(e) => report.expansion_error = Some(e.to_string()),
    }
    report
}

enum SetSource {
    File(PathBuf),
    Cluster { client: kube::Client, namespace: String, name: String },
}

impl SetSource {
    async fn load(&self) -> Result<ApplicationSet> {
        match self {
            SetSource::File(path) => load_set(path),
            SetSource::Cluster { client, namespace, name } => {
                appset_kubehub::fetch_application_set(client.clone(), namespace, name).await
            }
        }
    }
}

fn print_outcome(output: Output, out: &ReconcileOutcome) -> Result<()> {
    print(output, out, || {
        let requeue = out.requeue_after.map(|d| format!("{}s", d.as_secs())).unwrap_or_else(|| "-".to_string());
        println!(
            "desired={} created={} updated={} unchanged={} deleted={} requeue={}",
            out.desired.len(),
            out.stats.created,
            out.stats.updated,
            out.stats.unchanged,
            out.stats.deleted,
            requeue
        );
    })
}

async fn run_reconcile(output: Output, args: ReconcileArgs) -> Result<()> {
    let (source, store): (SetSource, Arc<dyn AppStore>) = match (args.file, args.name) {
        (Some(file), _) => {
            let store: Arc<dyn AppStore> = Arc::new(MemoryStore::new());
            (SetSource::File(file), store)
        }
        (None, Some(name)) => {
            let namespace = args.namespace.unwrap_or_default();
            let client = appset_kubehub::get_kube_client().await?;
            let store: Arc<dyn AppStore> = Arc::new(appset_kubehub::KubeStore::new(client.clone()));
            (SetSource::Cluster { client, namespace, name }, store)
        }
        (None, None) => bail!("one of --file or --name is required"),
    };
    let mut reconciler = Reconciler::new(app_generator(), store);
    if let Some(policy) = args.policy {
        reconciler = reconciler.with_policy(policy.into());
    }
    let default_delay = Duration::from_secs(args.requeue_secs);

    loop {
        let pass = async {
            let set = source.load().await?;
            let out = reconciler.reconcile(&set).await?;
            anyhow::Ok(out)
        };
        let delay = match pass.await {
            Ok(out) => {
                print_outcome(output, &out)?;
                out.requeue_after.unwrap_or(default_delay)
            }
            Err(e) if args.once => return Err(e),
            Err(e) => {
                error!(error = %e, "reconcile pass failed");
                default_delay
            }
        };
        if args.once {
            break;
        }
        info!(delay_secs = delay.as_secs(), "next pass scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping reconcile loop");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let set = load_set(&file)?;
            info!(set = %set.name(), "validate invoked");
            let report = validate_report(&set).await;
            print(cli.output, &report, || {
                if report.has_invalid {
                    let suffix = if report.unrecognized.is_empty() { String::new() } else { format!(": {}", report.unrecognized.join(", ")) };
                    println!("unrecognized generators{}", suffix);
                }
                if let Some(err) = &report.expansion_error {
                    println!("expansion failed: {}", err);
                }
                if let Some(dup) = &report.duplicate {
                    println!("duplicate application name: {}", dup);
                }
                if !report.has_invalid && !report.failed() {
                    println!("ok: {} applications", report.desired);
                }
            })?;
            if report.failed() {
                bail!("validation failed");
            }
        }
        Commands::Render { file } => {
            let set = load_set(&file)?;
            info!(set = %set.name(), "render invoked");
            let desired = app_generator().generate_applications(&set).await?;
            print(cli.output, &desired, || {
                println!("NAMESPACE   NAME                 PROJECT");
                for app in &desired {
                    let project = app.spec.get("project").and_then(|v| v.as_str()).unwrap_or("-");
                    println!("{:<11} {:<20} {}", set.namespace(), app.name(), project);
                }
            })?;
        }
        Commands::Reconcile(args) => run_reconcile(cli.output, args).await?,
    }

    Ok(())
}
