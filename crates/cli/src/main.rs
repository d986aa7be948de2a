use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

use mirra_api::{ApplyOptions, Mirra, MirraApi};
use mirra_cluster::{object_target, KubeCluster};
use mirra_core::{Classification, TypeKey};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "mirra: live cluster mirror with a safe edit/apply workflow")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace override for namespaced operations
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served custom types
    Discover,
    /// List namespaces
    Namespaces,
    /// List cached instances for a type key, e.g. "widgets.fabric.dev/v1/widgets"
    Ls {
        key: String,
        /// Block until the bucket's first full list before reading
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
    },
    /// Watch a type key and report cache refreshes
    Watch { key: String },
    /// Fetch one object fresh from the cluster
    Get { kind: String, name: String },
    /// Diff a local file against the object's current state
    Diff {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Validate and apply a local file
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Force the declarative submission path
        #[arg(long = "declarative", action = ArgAction::SetTrue)]
        declarative: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

/// Load a YAML document and hand it over as canonical JSON.
fn load_yaml(path: &PathBuf) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let val: serde_yaml::Value = serde_yaml::from_str(&text).context("parsing YAML")?;
    serde_json::to_value(val).context("converting YAML to JSON")
}

async fn resolve_definition(mirra: &Mirra, key: &TypeKey) -> Result<mirra_core::TypeDefinition> {
    let kinds = mirra.discover_types().await.map_err(|e| anyhow!("discover failed: {e}"))?;
    kinds
        .into_iter()
        .find(|d| &d.key() == key)
        .ok_or_else(|| anyhow!("type key not served: {key}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cluster = Arc::new(
        KubeCluster::connect()
            .await
            .map_err(|e| anyhow!("cluster connect failed: {e}"))?,
    );
    let mirra = Mirra::new(cluster);

    match cli.command {
        Commands::Discover => {
            let kinds = mirra.discover_types().await.map_err(|e| anyhow!("{e}"))?;
            match cli.output {
                Output::Human => {
                    for d in kinds {
                        let scope = if d.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", d.key(), d.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Namespaces => {
            let namespaces = mirra.list_namespaces().await.map_err(|e| anyhow!("{e}"))?;
            match cli.output {
                Output::Human => {
                    for ns in namespaces {
                        println!("{}", ns.name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&namespaces)?),
            }
        }
        Commands::Ls { key, wait } => {
            let key = TypeKey::parse(&key)?;
            let def = resolve_definition(&mirra, &key).await?;
            mirra.ensure_watching(&def);
            if wait {
                mirra.wait_ready(&key).await;
            }
            let items = mirra.cached_instances(&key, cli.namespace.as_deref());
            match cli.output {
                Output::Human => {
                    for o in items {
                        let ns = o.namespace.as_deref().unwrap_or("-");
                        println!("{} • {} • rv={}", ns, o.name, o.version_token);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Watch { key } => {
            let key = TypeKey::parse(&key)?;
            let def = resolve_definition(&mirra, &key).await?;
            mirra.ensure_watching(&def);
            let mut changes = mirra.subscribe_changes();
            info!(bucket = %key, "watching; ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    recv = changes.recv() => {
                        if recv.is_err() {
                            break;
                        }
                        let items = mirra.cached_instances(&key, cli.namespace.as_deref());
                        match cli.output {
                            Output::Human => println!("refresh • {} instance(s)", items.len()),
                            Output::Json => println!("{}", serde_json::to_string(&items)?),
                        }
                    }
                }
            }
            mirra.shutdown();
        }
        Commands::Get { kind, name } => {
            let raw = mirra
                .cluster()
                .get_object(&kind, &name, cli.namespace.as_deref())
                .await
                .map_err(|e| anyhow!("{e}"))?;
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&raw)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&raw)?),
            }
        }
        Commands::Diff { file } => {
            let mut proposed = load_yaml(&file)?;
            if let (Some(ns), Some(meta)) =
                (cli.namespace.as_deref(), proposed.get_mut("metadata").and_then(|m| m.as_object_mut()))
            {
                meta.entry("namespace".to_string())
                    .or_insert_with(|| serde_json::Value::String(ns.to_string()));
            }
            let target = object_target(&proposed).map_err(|e| anyhow!("{e}"))?;
            let handle = mirra
                .begin_edit(target.namespace.as_deref(), &target.kind, &target.name, None)
                .await
                .map_err(|e| anyhow!("{e}"))?;
            let summary = mirra.diff(&handle, &proposed);
            match cli.output {
                Output::Human => println!(
                    "adds={} updates={} removes={}",
                    summary.adds, summary.updates, summary.removes
                ),
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            }
            mirra.close_edit(&handle, false);
        }
        Commands::Apply { file, dry_run, declarative } => {
            let mut proposed = load_yaml(&file)?;
            if let (Some(ns), Some(meta)) =
                (cli.namespace.as_deref(), proposed.get_mut("metadata").and_then(|m| m.as_object_mut()))
            {
                meta.entry("namespace".to_string())
                    .or_insert_with(|| serde_json::Value::String(ns.to_string()));
            }
            let target = object_target(&proposed).map_err(|e| anyhow!("{e}"))?;
            let origin = declarative.then_some(Classification::Declarative);
            let handle = mirra
                .begin_edit(target.namespace.as_deref(), &target.kind, &target.name, origin)
                .await
                .map_err(|e| anyhow!("{e}"))?;
            let report = mirra
                .validate_and_apply(&handle, &proposed, ApplyOptions { dry_run })
                .await
                .map_err(|e| anyhow!("{e}"))?;
            match cli.output {
                Output::Human => {
                    if report.no_changes {
                        println!("no changes");
                    } else if report.dry_run {
                        println!(
                            "dry-run ok: adds={} updates={} removes={}",
                            report.summary.adds, report.summary.updates, report.summary.removes
                        );
                    } else {
                        let detail = match (&report.new_version, &report.transaction_id) {
                            (Some(rv), _) => format!("  •  rv={rv}"),
                            (None, Some(tx)) => format!("  •  tx={tx}"),
                            _ => String::new(),
                        };
                        println!(
                            "applied: adds={} updates={} removes={}{}",
                            report.summary.adds, report.summary.updates, report.summary.removes, detail
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            mirra.close_edit(&handle, false);
        }
    }

    Ok(())
}
