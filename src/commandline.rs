use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read one full telemetry snapshot: pack voltage, current, cells, temperatures, SOC
    Telemetry,
    /// Show State of Charge (SOC) from the configured register
    Soc,
    /// Show individual cell voltages
    CellVoltages,
    /// Show individual temperature sensor readings
    Temperatures,
    /// Scan for nearby BLE devices (Daly units advertise a DL- name prefix)
    Scan {
        /// How long to scan
        #[clap(long, value_parser = humantime::parse_duration, default_value = "15s")]
        timeout: Duration,
    },
    /// Run in daemon mode, periodically reading telemetry and publishing it
    Daemon {
        /// Output destination for readings
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval between reads (e.g., "30s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "30s")]
        interval: Duration,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read telemetry and print it to the standard output (console).
    Console,
    /// Continuously read telemetry and publish it to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

const fn about_text() -> &'static str {
    "daly bms BLE monitoring tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// MAC address of the BMS (Daly units also match by DL- name prefix during scan)
    #[arg(short, long, default_value = "41:18:12:01:37:71")]
    pub address: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// SOC register address, firmware dependent (e.g., 0x2C or 44)
    #[arg(value_parser = clap_num::maybe_hex::<u16>, long, default_value = "0x2C")]
    pub soc_register: u16,

    /// Wait window for the response to one command (e.g., "4s", "500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "4s")]
    pub response_timeout: Duration,

    /// Bounded wait for the scan fallback during connect
    #[arg(value_parser = humantime::parse_duration, long, default_value = "15s")]
    pub scan_timeout: Duration,

    /// Number of attempts for the whole connect sequence
    #[arg(long, default_value = "3")]
    pub connect_attempts: u8,
}

impl CliArgs {
    pub fn session_config(&self) -> dalyble_lib::SessionConfig {
        let mut config = dalyble_lib::SessionConfig::new(self.address.as_str());
        config.soc_register = self.soc_register;
        config.response_timeout = self.response_timeout;
        config.scan_timeout = self.scan_timeout;
        config.connect_attempts = self.connect_attempts;
        config
    }
}
