mod blocks;
mod exemption;
mod filters;
mod handlers;
mod persistence;
mod request_context;
mod server;
mod telemetry;

use anyhow::{Context, Result};
use blocks::BlockPoller;
use clap::Parser;
use exemption::AccountTypeExemption;
use filters::FilterRegistry;
use handlers::GatewayState;
use palisade_core::{
    spawn_flush_loop, AbuseGuard, BanStore, BlockCache, Discovery, ExemptionCheck,
    GasEstimateCache, GatewayConfig, NoExemptions, NodeEndpoint, NodePool, PerfRecorder,
    StatusSink, TxAdmission, TxForwarder, TxStatusRecorder, UpstreamClient,
};
use persistence::JsonlSink;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{init_tracing, sanitize_url, OtlpExport};
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Palisade JSON-RPC gateway")]
struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: std::net::IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8545)]
    port: u16,

    /// Discovery service URLs (comma separated in the environment)
    #[arg(long = "archiver", env = "ARCHIVER_URLS", value_delimiter = ',')]
    archivers: Vec<String>,

    /// Pin every call to one validator (ip:port) and skip discovery
    #[arg(long, env = "STATIC_NODE")]
    static_node: Option<NodeEndpoint>,

    /// Directory for ban lists and audit records
    #[arg(long, env = "PALISADE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// JSON policy file; values not named keep their defaults
    #[arg(long, env = "PALISADE_CONFIG")]
    config: Option<PathBuf>,

    /// Proxies whose X-Forwarded-For / X-Real-IP headers are believed (comma separated in
    /// the environment)
    #[arg(long = "trusted-proxy", env = "TRUSTED_PROXIES", value_delimiter = ',')]
    trusted_proxies: Vec<IpAddr>,

    #[arg(long, env = "CHAIN_ID", default_value_t = 8082)]
    chain_id: u64,

    /// Export traces over OTLP
    #[arg(long, env = "OTEL_ENABLED", default_value_t = false)]
    otel_enabled: bool,

    #[arg(
        long,
        env = "OTEL_EXPORTER_OTLP_ENDPOINT",
        default_value = "http://127.0.0.1:4317"
    )]
    otel_endpoint: String,

    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "palisade-rpc-adapter")]
    otel_service_name: String,

    #[arg(long, env = "OTEL_ENVIRONMENT", default_value = "dev")]
    otel_environment: String,

    /// Print the merged configuration as JSON and exit
    #[arg(long, default_value_t = false)]
    print_effective_config: bool,
}

impl Args {
    fn otlp(&self) -> OtlpExport {
        OtlpExport {
            enabled: self.otel_enabled,
            endpoint: self.otel_endpoint.clone(),
            service_name: self.otel_service_name.clone(),
            environment: self.otel_environment.clone(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    let Some(path) = path else {
        return Ok(GatewayConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Defaults, then the config file, then CLI/env.
fn effective_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = load_config(args.config.as_deref())?;
    if !args.archivers.is_empty() {
        config.discovery.archivers = args.archivers.clone();
    }
    if let Some(node) = &args.static_node {
        config.node_selection.use_static_node = true;
        config.node_selection.static_node = Some(node.clone());
    }
    config.validate().context("invalid gateway configuration")?;
    Ok(config)
}

fn print_effective_config(args: &Args, config: &GatewayConfig) -> Result<()> {
    let mut gateway = config.clone();
    gateway.discovery.archivers = gateway
        .discovery
        .archivers
        .iter()
        .map(|url| sanitize_url(url))
        .collect();
    let mut otel = args.otlp();
    otel.endpoint = sanitize_url(&otel.endpoint);

    let effective = json!({
        "host": args.host,
        "port": args.port,
        "chainId": args.chain_id,
        "dataDir": args.data_dir,
        "trustedProxies": args.trusted_proxies,
        "otel": otel,
        "gateway": gateway,
    });
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = effective_config(&args)?;
    if args.print_effective_config {
        return print_effective_config(&args, &config);
    }

    let _tracer = init_tracing(&args.otlp())?;

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data dir {}", args.data_dir.display()))?;

    let sink: Arc<dyn StatusSink> = Arc::new(JsonlSink::new(&args.data_dir));
    let tx_statuses = Arc::new(TxStatusRecorder::new(
        sink.clone(),
        config.recorder.flush_threshold,
    ));
    let perf = Arc::new(PerfRecorder::new(sink));
    spawn_flush_loop(
        tx_statuses.clone(),
        perf.clone(),
        Duration::from_secs(config.recorder.flush_interval_secs.max(1)),
    );

    let pool = Arc::new(NodePool::new(&config.node_selection, &config.upstream));
    if pool.is_static() {
        info!(node = ?pool.active(), "Static node selection, discovery disabled");
    } else {
        let discovery = Arc::new(Discovery::new(config.discovery.clone(), pool.clone()));
        let archivers: Vec<String> = config
            .discovery
            .archivers
            .iter()
            .map(|u| sanitize_url(u))
            .collect();
        info!(?archivers, "Bootstrapping node list");
        let count = discovery
            .bootstrap()
            .await
            .context("cannot route traffic without a discovery service")?;
        info!(count, "Node pool ready");
        discovery.spawn_refresh_loop();
    }

    let upstream = Arc::new(UpstreamClient::new(pool, config.upstream.clone()));

    let exemptions: Arc<dyn ExemptionCheck> = if config.rate_limit.exempt_account_types.is_empty() {
        Arc::new(NoExemptions)
    } else {
        Arc::new(AccountTypeExemption::new(
            upstream.clone(),
            config.rate_limit.exempt_account_types.clone(),
        ))
    };
    let guard = Arc::new(AbuseGuard::new(
        config.rate_limit.clone(),
        Arc::new(BanStore::new(&args.data_dir)),
        tx_statuses.clone(),
        exemptions,
    ));
    if config.rate_limit.enabled {
        guard.spawn_sweep_loops();
    } else {
        warn!("Rate limiting disabled");
    }

    let gas_cache = Arc::new(GasEstimateCache::new(
        config.admission.gas_estimate_ttl_secs * 1_000,
        config.admission.gas_estimate_max_entries,
    ));
    let forwarder: Arc<dyn TxForwarder> = upstream.clone();
    let admission = Arc::new(TxAdmission::new(
        config.admission.clone(),
        forwarder,
        tx_statuses,
        gas_cache.clone(),
    ));
    admission.spawn_backlog_sweep();

    let block_cache = Arc::new(BlockCache::new(config.block_cache.max_entries));
    let latest_block = Arc::new(AtomicU64::new(0));
    BlockPoller::new(
        block_cache.clone(),
        upstream.clone(),
        latest_block.clone(),
        config.block_cache.clone(),
    )
    .spawn();

    let state = Arc::new(GatewayState {
        chain_id: args.chain_id,
        upstream,
        guard,
        admission,
        block_cache,
        gas_cache,
        filters: FilterRegistry::new(),
        latest_block,
        perf,
    });
    let module = handlers::rpc_module(state)?;

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    if args.trusted_proxies.is_empty() {
        info!("No trusted proxies, clients are identified by socket address");
    } else {
        info!(proxies = ?args.trusted_proxies, "Trusting forwarding headers from proxies");
    }

    info!("Palisade RPC gateway listening on {}", addr);
    let handle = server::spawn(listener, module, args.trusted_proxies.clone());
    tokio::select! {
        _ = handle.clone().stopped() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("Shutting down");
                let _ = handle.stop();
            }
            Err(e) => {
                warn!("Cannot listen for ctrl-c, serving until stopped: {}", e);
                handle.stopped().await;
            }
        },
    }

    Ok(())
}
