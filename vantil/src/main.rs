use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, instrument};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

mod cli;

use vantil_iot::metrics::MetricsSampler;
use vantil_iot::provisioning::{provision, ProvisioningConfig};
use vantil_iot::session::{Session, SessionConfig};
use vantil_iot::telemetry::{start_report, ReportConfig};
use vantil_util::identity::{thing_name, Identity};
use vantil_util::types::Serial;

use crate::cli::{Cli, Command};

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse().unwrap())
                    .add_directive("rumqttc=warn".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = cli::parse();

    match cli.command.clone() {
        Some(Command::Register {
            serial,
            cert_path,
            key_path,
            template,
            response_timeout,
        }) => register(&cli, serial, cert_path, key_path, template, response_timeout).await,
        None => send_reports(&cli).await,
    }
}

/// Exchange the bootstrap certificate for a permanent device identity and
/// persist it to the working directory.
#[instrument(name = "register", skip_all, fields(serial = %serial), err)]
async fn register(
    cli: &Cli,
    serial: Serial,
    cert_path: PathBuf,
    key_path: PathBuf,
    template: String,
    response_timeout: Duration,
) -> Result<()> {
    let session = Session::connect(&SessionConfig {
        endpoint: cli.endpoint.clone(),
        port: cli.port,
        client_id: format!("bootstrap-{serial}"),
        ca_path: cli.ca_path.clone(),
        certificate_path: cert_path,
        private_key_path: key_path,
        clean_session: true,
        keep_alive: cli.keep_alive,
    })
    .await?;

    let config = ProvisioningConfig {
        template,
        response_timeout,
    };
    let identity = provision(&session, &config, &serial).await?;

    identity.write(&env::current_dir()?)?;
    info!(
        "created {} and {}",
        Identity::certificate_path(&serial).display(),
        Identity::private_key_path(&serial).display()
    );

    session.disconnect().await?;

    Ok(())
}

/// Run the telemetry sender with the permanent identity until interrupted.
#[instrument(name = "send", skip_all, fields(serial = %cli.serial), err)]
async fn send_reports(cli: &Cli) -> Result<()> {
    let serial = cli.serial.clone();

    let session = Session::connect(&SessionConfig {
        endpoint: cli.endpoint.clone(),
        port: cli.port,
        client_id: thing_name(&serial),
        ca_path: cli.ca_path.clone(),
        certificate_path: Identity::certificate_path(&serial),
        private_key_path: Identity::private_key_path(&serial),
        clean_session: false,
        keep_alive: cli.keep_alive,
    })
    .await?;

    // Stop the report loop on interrupt so the session closes gracefully
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            let _ = stop_tx.send(true);
        }
    });

    let config = ReportConfig {
        device: cli.device.clone(),
        serial,
        interval: cli.report_interval,
    };
    let mut sampler = MetricsSampler::new();

    start_report(&session, &config, &mut sampler, stop_rx).await?;

    Ok(())
}
