use crate::{config, mqtt};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use essbms_lib::protocol::Address;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    clap_num::number_range(s, Address::MIN, Address::MAX)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read the firmware version to check that the BMS answers
    Probe,
    /// Search the RS485 bus for batteries by probing a range of slave addresses
    Scan {
        /// First slave address to probe
        #[arg(long, value_parser = parse_address, default_value_t = Address::MIN)]
        from: u8,
        /// Last slave address to probe
        #[arg(long, value_parser = parse_address, default_value_t = 16)]
        to: u8,
    },
    /// Show individual cell voltages and temperature sensor readings
    Cells,
    /// Show charge/discharge voltage and current limits (clamped to the configured safety limits)
    Limits,
    /// Show SOC, pack voltage, pack current, BMS temperature and active faults
    Status,
    /// Read all register blocks once and show the battery snapshot including protection states
    Poll,
    /// Run in daemon mode, periodically polling the battery and outputting the snapshot
    Daemon {
        /// Output destination for the snapshot
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for polling the battery (e.g., "1s", "10s")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll the battery and print the snapshot to the standard output (console).
    Console,
    /// Continuously poll the battery and publish the snapshot to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "Felicity ESS battery command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Modbus slave address of the battery (1-247)
    #[arg(short, long, value_parser = parse_address, default_value_t = 1)]
    pub address: u8,

    /// Configuration file with the safety limits of the battery
    #[arg(short, long, default_value_t = config::BatteryConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for a single register read (e.g., "400ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "400ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles require at least 10ms to switch between TX and RX,
    // so use a safe delay between frames
    /// Delay between sending multiple requests to the BMS (e.g., "15ms", "50ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "15ms")]
    pub delay: Duration,
}
