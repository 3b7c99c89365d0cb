use clap::Parser;
use eyre::format_err;
use kube::{Client, runtime::watcher};
use log::{error, info};
use std::process::exit;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use sdn_proxy::config::Config;
use sdn_proxy::egress_dns::{EgressDns, SystemResolver};
use sdn_proxy::osdn::OsdnProxy;
use sdn_proxy::proxy::{ProxyProvider, batch::Batcher, exec::ExecProxy, hybrid::HybridProxier};
use sdn_proxy::unidler::{Signaler, proxy::UnidlingProxy};
use sdn_proxy::{Context, kube_watch};

/// SDN service proxy
#[derive(Parser)]
#[command(version, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "SDN_PROXY_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "SDN_PROXY_LOG_STYLE")]
    log_style: String,

    /// my node name (hint: {valueFrom: {fieldRef: { fieldPath: spec.nodeName }}})
    #[arg(
        long,
        env = "NODE_NAME",
        default_value_t = default_nodename()
    )]
    node_name: String,

    /// Config file path.
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: String,

    /// Test the config and exit.
    #[arg(long)]
    test_config: bool,
}

const ABOUT: &str = r#"
SDN service proxy

Watch the Kubernetes API server to proxy services on this node:
- endpoints outside the cluster are filtered by the namespace's EgressNetworkPolicy
- idled services are held until their pods are back
- other services are handed to the configured rule programmer
"#;

fn default_nodename() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|s| s.to_string_lossy().into_owned())
}

type Tasks = tokio::task::JoinSet<(String, eyre::Result<()>)>;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    let config = tokio::fs::read(&cli.config)
        .await
        .map_err(|e| format_err!("read config failed: {}: {e}", cli.config))?;
    let config: Config =
        serde_yaml::from_slice(&config).map_err(|e| format_err!("parse config failed: {e}"))?;

    config.validate()?;
    let cluster_url = config.cluster_url()?;

    if cli.test_config {
        return Ok(());
    }

    info!("sdn-proxy {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT"));

    let stop = CancellationToken::new();
    {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            };
            stop.cancel();
        });
    }

    info!("starting as node {}", cli.node_name);

    let mut kube_cfg = kube::Config::infer().await?;
    if let Some(cluster_url) = cluster_url {
        kube_cfg.cluster_url = cluster_url;
    }

    info!("kubernetes cluster at {}", kube_cfg.cluster_url);

    let kube: Client = kube_cfg.try_into()?;

    match &config.namespace {
        None => info!("watching services in all namespaces"),
        Some(ns) => info!("watching services in namespace {ns}"),
    };

    let ctx = Context {
        node_name: cli.node_name,
        namespace: config.namespace.clone(),
        kube,
    };

    // proxier stack
    let (egress_dns, dns_updates) = EgressDns::new(SystemResolver::new(), &config.egress_dns);

    let signaler = Signaler::new(&config.unidling.signaler, ctx.kube.clone(), ctx.node_name.clone());
    let unidling = UnidlingProxy::new(config.unidling.clone(), signaler);
    let main_proxy = ExecProxy::new(config.proxy.clone());
    let hybrid = HybridProxier::new(main_proxy, unidling, config.sync_period());

    let proxy = OsdnProxy::start(Batcher::new(hybrid), &ctx.kube, egress_dns.clone()).await?;
    let proxy = Arc::new(proxy);

    let watch_config = kube_watch::Config {
        namespace: ctx.namespace.clone(),
        client: ctx.kube.clone(),
        watcher_config: watcher::Config::default(),
    };

    let mut tasks = Tasks::new();

    tasks.spawn({
        let stop = stop.clone();
        async move {
            egress_dns.sync(stop).await;
            ("egress-dns".into(), Ok(()))
        }
    });

    tasks.spawn({
        let (proxy, kube, stop) = (proxy.clone(), ctx.kube.clone(), stop.clone());
        async move {
            proxy.run_dns_updates(dns_updates, &kube, stop).await;
            ("egress-dns-updates".into(), Ok(()))
        }
    });

    tasks.spawn({
        let (proxy, stop) = (proxy.clone(), stop.clone());
        async move {
            proxy.sync_loop(stop).await;
            ("proxy".into(), Ok(()))
        }
    });

    tasks.spawn({
        let (proxy, stop) = (proxy.clone(), stop.clone());
        let event_buffer = config.event_buffer;
        async move {
            sdn_proxy::process_kube_events(&*proxy, watch_config, event_buffer, stop).await;
            ("kube-events".into(), Ok(()))
        }
    });

    // any task ending before a stop is requested is fatal; the others are then stopped cleanly
    let mut failed = false;
    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => {
                error!("task wait failed: {e}");
            }
            Ok((name, Ok(_))) if stop.is_cancelled() => {
                info!("task {name} finished");
                continue;
            }
            Ok((name, Ok(_))) => {
                error!("task {name} finished unexpectedly");
            }
            Ok((name, Err(e))) => {
                error!("task {name} finished with error: {e}");
            }
        }
        failed = true;
        stop.cancel();
    }

    info!("all tasks finished");
    exit(if failed { 1 } else { 0 });
}
