use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kmeta_api::FunctionContext;
use kmeta_core::{PidInfo, ResourceUpdate, Upid};
use kmeta_store::{spawn_ingest, AgentInfo, AgentMetadataState, IngestConfig, IngestMsg, MetadataHandle};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "kmetactl", version, about = "kmeta metadata state CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Agent short id of this node
    #[arg(long, global = true, env = "KMETA_ASID", default_value_t = 0)]
    asid: u32,

    /// Hostname reported by the `hostname` function
    #[arg(long, global = true, env = "KMETA_HOSTNAME", default_value = "")]
    hostname: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a recorded update stream (JSON lines) and print a summary
    Replay {
        events: PathBuf,
        /// Process registrations (JSON lines of {upid, cmdline, container})
        #[arg(long)]
        pids: Option<PathBuf>,
        /// Wait for a publication after every N events
        #[arg(long, default_value_t = 0)]
        batch: usize,
    },
    /// Replay, then evaluate one metadata function
    Query {
        /// Function name, see `kmetactl functions`
        function: String,
        /// UPID (asid:pid:start_ts), UID or name, depending on the function
        #[arg(default_value = "")]
        arg: String,
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        pids: Option<PathBuf>,
    },
    /// List the metadata functions
    Functions,
    /// Mirror the live cluster for one node until Ctrl-C
    Watch {
        #[arg(long, env = "KMETA_NODE_NAME")]
        node: String,
    },
}

/// One line of a process registration file.
#[derive(Debug, Deserialize)]
struct PidLine {
    upid: String,
    #[serde(default)]
    cmdline: String,
    #[serde(default)]
    container: String,
    #[serde(default)]
    stop_ts: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct ReplaySummary {
    events: usize,
    undecodable: usize,
    pids: usize,
    #[serde(flatten)]
    stats: kmeta_store::StateStats,
}

fn init_tracing() {
    let env = std::env::var("KMETA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMETA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KMETA_METRICS_ADDR; expected host:port");
        }
    }
}

fn agent(cli: &Cli) -> AgentInfo {
    AgentInfo::new(cli.asid, Uuid::new_v4(), cli.hostname.clone(), String::new())
}

fn lines(path: &Path) -> Result<impl Iterator<Item = (usize, std::io::Result<String>)>> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(f).lines().enumerate().map(|(i, l)| (i + 1, l)))
}

fn read_pids(path: &Path, out: &mut Vec<IngestMsg>) -> Result<usize> {
    let mut n = 0;
    for (lineno, line) in lines(path)? {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let p: PidLine = serde_json::from_str(&line).with_context(|| format!("{}:{}", path.display(), lineno))?;
        let upid: Upid = p.upid.parse().with_context(|| format!("{}:{}", path.display(), lineno))?;
        out.push(IngestMsg::Upid(upid, PidInfo::new(upid, p.cmdline, p.container)));
        if let Some(ts) = p.stop_ts {
            out.push(IngestMsg::UpidStopped(upid, ts));
        }
        n += 1;
    }
    Ok(n)
}

/// Feed `events` (and then `pids`) through a fresh ingest loop and return the
/// final snapshot once the loop has drained everything.
async fn replay(cli: &Cli, events: &Path, pids: Option<&Path>, batch: usize) -> Result<(Arc<AgentMetadataState>, ReplaySummary)> {
    let (tx, handle) = spawn_ingest(AgentMetadataState::new(agent(cli)), IngestConfig::from_env());
    let mut epochs = handle.subscribe_epoch();
    let mut summary = ReplaySummary::default();

    for (lineno, line) in lines(events)? {
        let line = line.with_context(|| format!("reading {}", events.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match ResourceUpdate::from_json(&line) {
            Ok(u) => {
                tx.send(IngestMsg::Update(u)).map_err(|_| anyhow!("ingest loop exited early"))?;
                summary.events += 1;
                if batch > 0 && summary.events % batch == 0 {
                    let _ = epochs.changed().await;
                }
            }
            Err(e) => {
                warn!(line = lineno, error = %e, "skipping undecodable event");
                summary.undecodable += 1;
            }
        }
    }
    if let Some(p) = pids {
        let mut msgs = Vec::new();
        summary.pids = read_pids(p, &mut msgs)?;
        for m in msgs {
            tx.send(m).map_err(|_| anyhow!("ingest loop exited early"))?;
        }
    }

    // closing the queue makes the loop drain, publish and exit
    drop(tx);
    while epochs.changed().await.is_ok() {}
    let snap = handle.current();
    summary.stats = snap.stats();
    Ok((snap, summary))
}

async fn watch(cli: &Cli, node: &str) -> Result<()> {
    let (tx, handle) = spawn_ingest(
        AgentMetadataState::new(agent(cli).with_node_name(node)),
        IngestConfig::from_env(),
    );
    let watchers = tokio::spawn({
        let node = node.to_string();
        async move {
            if let Err(e) = kmeta_kubehub::start_watchers(&node, tx).await {
                error!(error = ?e, "watchers failed");
            }
        }
    });
    let mut epochs = handle.subscribe_epoch();
    loop {
        tokio::select! {
            changed = epochs.changed() => {
                if changed.is_err() {
                    warn!("ingest loop exited");
                    break;
                }
                print_epoch(cli.output, &handle)?;
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    handle.stop();
    watchers.abort();
    Ok(())
}

fn print_epoch(output: Output, handle: &MetadataHandle) -> Result<()> {
    let st = handle.current().stats();
    match output {
        Output::Human => println!(
            "epoch {} rv {} pods {}/{} containers {}/{} services {}/{} upids {}",
            st.epoch, st.resource_version, st.live_pods, st.pods, st.live_containers, st.containers,
            st.live_services, st.services, st.upids
        ),
        Output::Json => println!("{}", serde_json::to_string(&st)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Replay { events, pids, batch } => {
            info!(events = %events.display(), "replay invoked");
            let (_, summary) = replay(&cli, events, pids.as_deref(), *batch).await?;
            match cli.output {
                Output::Human => {
                    let st = &summary.stats;
                    println!("events      {} ({} undecodable)", summary.events, summary.undecodable);
                    println!("processes   {}", summary.pids);
                    println!("epoch       {}", st.epoch);
                    println!("version     {}", st.resource_version);
                    println!("namespaces  {}", st.namespaces);
                    println!("pods        {} ({} live)", st.pods, st.live_pods);
                    println!("containers  {} ({} live)", st.containers, st.live_containers);
                    println!("services    {} ({} live)", st.services, st.live_services);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            }
        }
        Commands::Query { function, arg, events, pids } => {
            if kmeta_api::lookup(function).is_none() {
                return Err(anyhow!("unknown function {:?}; see `kmetactl functions`", function));
            }
            let (snap, _) = replay(&cli, events, pids.as_deref(), 0).await?;
            let ctx = FunctionContext::new(snap);
            let value = kmeta_api::call(&ctx, function, arg)?;
            match (cli.output, &value) {
                (Output::Human, serde_json::Value::String(s)) => println!("{}", s),
                _ => println!("{}", value),
            }
        }
        Commands::Functions => match cli.output {
            Output::Human => {
                for (name, udf) in kmeta_api::REGISTRY {
                    println!("{:<34} {:?}", name, udf.arg_kind());
                }
            }
            Output::Json => {
                let list: Vec<_> = kmeta_api::REGISTRY
                    .iter()
                    .map(|(name, udf)| serde_json::json!({ "name": name, "arg": udf.arg_kind() }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            }
        },
        Commands::Watch { node } => {
            info!(node = %node, "watch invoked");
            watch(&cli, node).await?;
        }
    }
    Ok(())
}
