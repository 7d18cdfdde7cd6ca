// SPDX-License-Identifier: MIT OR Apache-2.0
//! vCD extension proxy daemon: broker connection lifecycle, signal handling,
//! and top-level error capture.

#![deny(unsafe_code)]

use anyhow::Context as _;
use clap::Parser;
use lapin::{Connection, ConnectionProperties};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vxp_config::{AmqpSettings, ConfigError, Registry, SupervisorSettings};
use vxp_dispatch::{AllowAll, DispatchError, Dispatcher, ExtensionRuntime};
use vxp_error::ProxyError;
use vxp_extension::{DescriptorError, load_descriptors};

/// Heartbeat negotiated with the broker, in seconds.
const HEARTBEAT_SECS: u16 = 4;

#[derive(Parser, Debug)]
#[command(name = "vxp-proxyd", version, about = "vCD extension proxy daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "vcdextproxy.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("vxp=debug,lapin=info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vxp=info,lapin=warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting the vCD extension proxy service");
    match run(&args).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = format!("{err:#}"), "fatal error");
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let registry = Registry::from_path(&args.config).context("loading configuration")?;
    let amqp = AmqpSettings::from_registry(&registry).context("reading global.amqp settings")?;
    let supervisor =
        SupervisorSettings::from_registry(&registry).context("reading supervisor settings")?;

    let runtimes = load_descriptors(&registry)
        .context("building extension descriptors")?
        .into_iter()
        .map(ExtensionRuntime::new)
        .collect::<Result<Vec<_>, _>>()
        .context("building backend clients")?;

    info!(host = %amqp.host, port = amqp.port, vhost = %amqp.vhost,
        "connecting to the broker");
    let connection = Connection::connect(
        &amqp.url(HEARTBEAT_SECS),
        ConnectionProperties::default(),
    )
    .await
    .context("connecting to the broker")?;
    let channel = connection
        .create_channel()
        .await
        .context("opening a broker channel")?;

    let dispatcher = Dispatcher::register(
        &channel,
        runtimes,
        Arc::new(AllowAll),
        supervisor.max_workers,
    )
    .await
    .context("registering extension consumers")?;
    let inflight = dispatcher.inflight();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers = tokio::spawn(dispatcher.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for the interrupt signal")?;
            info!("interrupt signal caught, shutting down");
        }
        _ = &mut consumers => {
            anyhow::bail!("all consumer loops ended unexpectedly, broker connection lost?");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = consumers.await;

    if inflight.wait_idle(supervisor.shutdown_grace).await {
        info!("all in-flight requests drained");
    } else {
        warn!(remaining = inflight.count(),
            "grace period elapsed, abandoning in-flight requests");
    }

    connection.close(200, "shutdown").await.ok();
    Ok(())
}

/// Configuration mistakes exit `2`; every other fatal error exits `1`.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some()
            || cause.downcast_ref::<DescriptorError>().is_some()
        {
            return 2;
        }
        if let Some(proxy) = cause.downcast_ref::<ProxyError>() {
            if proxy.kind.is_startup_fatal() {
                return 2;
            }
        }
        if let Some(DispatchError::Proxy(proxy)) = cause.downcast_ref::<DispatchError>() {
            if proxy.kind.is_startup_fatal() {
                return 2;
            }
        }
    }
    1
}
