#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::runtime::watcher;
use lbex_controller::{Controller, MemoryConfigurator, RunParams, Watches};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Parser)]
#[clap(version)]
struct Args {
    #[clap(long, env = "LBEX_LOG_LEVEL", default_value = "lbex=info,warn")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Only manage the service with this name, rather than every opted-in
    /// service
    #[clap(long)]
    service: Option<String>,

    /// Seconds to let node and endpoint caches fill before reconciling services
    #[clap(long, default_value = "5")]
    settle_delay_secs: u64,

    /// Seconds between full re-reconciliations of every cached object
    #[clap(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    resync_period_secs: u64,

    /// Concurrent syncs per resource kind
    #[clap(long, default_value = "1")]
    workers: usize,

    /// Milliseconds between polls of an idle work queue
    #[clap(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    drain_period_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        service,
        settle_delay_secs,
        resync_period_secs,
        workers,
        drain_period_ms,
    } = Args::parse();

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let watches = Watches {
        nodes: runtime.watch_all::<Node>(watcher::Config::default()),
        services: runtime.watch_all::<Service>(watcher::Config::default()),
        endpoints: runtime.watch_all::<Endpoints>(watcher::Config::default()),
    };
    if let Some(ref name) = service {
        tracing::info!(service = %name, "managing a single service");
    }
    let (controller, informers) = Controller::new(
        MemoryConfigurator::default(),
        service,
        time::Duration::from_secs(resync_period_secs),
    );
    let params = RunParams {
        settle: time::Duration::from_secs(settle_delay_secs),
        workers,
        drain_period: time::Duration::from_millis(drain_period_ms),
    };

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(
        controller
            .run(informers, watches, params, shutdown.clone())
            .instrument(tracing::info_span!("lbex")),
    );

    // Block the main thread on the shutdown signal. Once it fires, stop the watches and wait for
    // in-flight syncs to complete before exiting.
    let res = runtime.run().await;
    shutdown.cancel();
    task.await?;
    if res.is_err() {
        bail!("aborted");
    }

    Ok(())
}
