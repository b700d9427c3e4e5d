use anyhow::{Context, Result};
use clap::Parser;
use essbms_lib::battery::BatteryDriver;
use essbms_lib::felicity::{self, FelicityEss};
use essbms_lib::protocol::{Address, RegisterClient};
use essbms_lib::serialport::ModbusRtu;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn scan<C: RegisterClient>(client: &mut C, from: u8, to: u8) -> Result<()> {
    let candidates = (from..=to).filter_map(|address| Address::try_from(address).ok());
    let found = felicity::scan(client, candidates);
    if found.is_empty() {
        println!("No battery found on slave addresses {from}..={to}");
    }
    for (address, version) in found {
        println!("Slave address {address}: firmware version {version}");
    }
    Ok(())
}

fn print_snapshot<C: RegisterClient>(bms: &FelicityEss<C>) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(bms.snapshot()).with_context(|| "Cannot format snapshot")?
    );
    Ok(())
}

fn run_command<C: RegisterClient>(mut bms: FelicityEss<C>, command: CliCommands) -> Result<()> {
    match command {
        CliCommands::Probe => {
            bms.test_connection()
                .with_context(|| "Cannot connect to battery")?;
            if let Some(version) = bms.snapshot().firmware_version {
                println!("Firmware version: {:#06X}", version);
            }
        }
        CliCommands::Cells => {
            bms.read_cell_data()
                .with_context(|| "Cannot get cell voltages and temperatures")?;
            let snapshot = bms.snapshot();
            let voltages: Vec<f32> = snapshot.cells.iter().map(|cell| cell.voltage).collect();
            let temperatures: Vec<f32> = snapshot
                .temperatures
                .iter()
                .map(|t| t.value_celsius)
                .collect();
            println!("Cell voltages: {:?}", voltages);
            println!("Cell temperatures: {:?}", temperatures);
        }
        CliCommands::Limits => {
            bms.read_limits().with_context(|| "Cannot get limits")?;
            println!("Limits: {:?}", bms.snapshot().limits);
        }
        CliCommands::Status => {
            bms.read_pack_status()
                .with_context(|| "Cannot get pack status")?;
            let pack = &bms.snapshot().pack;
            println!("Pack status: {:?}", pack);
            for fault in pack.faults() {
                println!("Fault: {fault}");
            }
        }
        CliCommands::Poll => {
            let report = bms.poll();
            if !report.is_valid() {
                warn!("Incomplete poll: {:?}", report);
            }
            print_snapshot(&bms)?;
        }
        CliCommands::Daemon { output, interval } => {
            bms.test_connection()
                .with_context(|| "Cannot connect to battery")?;
            daemon::run(bms, output, interval)?;
        }
        CliCommands::Scan { from, to } => {
            let mut client = bms.into_client();
            scan(&mut client, from, to)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = config::BatteryConfig::load_or_default(&args.config)?;
    debug!("Battery config: {config:?}");

    let mut client = ModbusRtu::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    client.set_timeout(args.timeout)?;
    client.set_delay(args.delay);

    let address = Address::try_from(args.address)?;
    run_command(FelicityEss::new(client, address, config.safety), args.command)
}
