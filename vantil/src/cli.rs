use clap::{Parser, Subcommand};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use vantil_util::types::Serial;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// IoT broker endpoint hostname
    #[arg(
        env = "VANTIL_ENDPOINT",
        long = "endpoint",
        value_name = "host",
        default_value = "a24vf5ncyln50t-ats.iot.eu-north-1.amazonaws.com"
    )]
    pub endpoint: String,

    /// IoT broker MQTT port
    #[arg(
        env = "VANTIL_PORT",
        long = "port",
        value_name = "port",
        default_value_t = 8883
    )]
    pub port: u16,

    /// Root CA trust bundle path
    #[arg(
        env = "VANTIL_CA_PATH",
        long = "ca-path",
        value_name = "path",
        default_value = "AmazonRootCA1.pem"
    )]
    pub ca_path: PathBuf,

    /// Serial number of this device
    #[arg(
        env = "VANTIL_SERIAL",
        long = "serial",
        value_name = "serial",
        default_value = "001"
    )]
    pub serial: Serial,

    /// Device tag attached to telemetry reports
    #[arg(
        env = "VANTIL_DEVICE",
        long = "device",
        value_name = "name",
        default_value = "laptop"
    )]
    pub device: String,

    /// Telemetry publish interval in milliseconds
    #[arg(
        env = "VANTIL_REPORT_INTERVAL_MS",
        long = "report-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "5000"
    )]
    pub report_interval: Duration,

    /// MQTT keep-alive interval in milliseconds
    #[arg(
        env = "VANTIL_KEEP_ALIVE_MS",
        long = "keep-alive-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub keep_alive: Duration,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Exchange the bootstrap certificate for a permanent device identity
    Register {
        /// Serial number to register
        #[arg(value_name = "serial")]
        serial: Serial,

        /// Bootstrap certificate path
        #[arg(
            env = "VANTIL_BOOTSTRAP_CERT",
            long = "bootstrap-cert",
            value_name = "path",
            default_value = "bootstrap-certificate.pem.crt"
        )]
        cert_path: PathBuf,

        /// Bootstrap private key path
        #[arg(
            env = "VANTIL_BOOTSTRAP_KEY",
            long = "bootstrap-key",
            value_name = "path",
            default_value = "bootstrap-private.pem.key"
        )]
        key_path: PathBuf,

        /// Fleet-provisioning template name
        #[arg(
            env = "VANTIL_TEMPLATE",
            long = "template",
            value_name = "name",
            default_value = "Vantilator"
        )]
        template: String,

        /// Handshake reply timeout in milliseconds
        #[arg(
            env = "VANTIL_RESPONSE_TIMEOUT_MS",
            long = "response-timeout-ms",
            value_name = "ms",
            value_parser = parse_duration,
            default_value = "5000"
        )]
        response_timeout: Duration,
    },
}

pub fn parse() -> Cli {
    Parser::parse()
}
