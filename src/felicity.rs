//! Driver for Felicity ESS batteries, read over Modbus RTU.
//!
//! # Example
//!
//! ```no_run
//! use essbms_lib::battery::BatteryDriver;
//! use essbms_lib::felicity::FelicityEss;
//! use essbms_lib::protocol::{Address, SafetyLimits};
//! use essbms_lib::serialport::ModbusRtu;
//!
//! fn main() -> Result<(), essbms_lib::Error> {
//!     let client = ModbusRtu::new("/dev/ttyUSB0")?;
//!     let mut bms = FelicityEss::new(client, Address::default(), SafetyLimits::default());
//!     bms.test_connection()?;
//!     if bms.refresh() {
//!         println!("{:?}", bms.snapshot());
//!     }
//!     Ok(())
//! }
//! ```

use crate::battery::{BatteryDriver, BatterySnapshot};
use crate::protection::{self, CurrentControl};
use crate::protocol::*;
use crate::{Error, Result};

pub const BATTERY_TYPE: &str = "Felicity_ESS_modbus";
pub const CELL_COUNT: usize = 16;
pub const TEMP_COUNT: usize = 8;
/// Number of firmware version reads before the device is reported as missing.
pub const RETRY_COUNT: u8 = 3;

/// Which register blocks were refreshed by a poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub cell_data: bool,
    pub limits: bool,
    pub pack_status: bool,
}

impl PollReport {
    pub fn is_valid(&self) -> bool {
        self.cell_data && self.limits && self.pack_status
    }
}

#[derive(Debug)]
pub struct FelicityEss<C: RegisterClient> {
    client: C,
    address: Address,
    safety: SafetyLimits,
    snapshot: BatterySnapshot,
}

impl<C: RegisterClient> FelicityEss<C> {
    /// Creates a driver for the battery at `address`.
    ///
    /// Until the first successful read the limits are the most permissive ones `safety` allows.
    pub fn new(client: C, address: Address, safety: SafetyLimits) -> Self {
        let snapshot = BatterySnapshot::new(
            BATTERY_TYPE,
            address.to_string(),
            CELL_COUNT,
            TEMP_COUNT,
            safety.limits(CELL_COUNT),
        );
        Self {
            client,
            address,
            safety,
            snapshot,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Releases the register client, e.g. to probe other addresses on the same bus.
    pub fn into_client(self) -> C {
        self.client
    }

    fn read_block(&mut self, address: u16, quantity: u16) -> Result<Vec<Word>> {
        let words = self
            .client
            .read_holding_registers(self.address, address, quantity)?;
        log::debug!(
            "Response slave={} address={:#06X} words={:?}",
            self.address,
            address,
            words
        );
        Ok(words)
    }

    pub fn read_firmware_version(&mut self) -> Result<FirmwareVersion> {
        let words = self.read_block(FirmwareVersion::ADDRESS, FirmwareVersion::QUANTITY)?;
        FirmwareVersion::decode_from_holding_registers(&words)
    }

    /// Reads the cell voltages and temperatures. On failure the previous values are kept.
    pub fn read_cell_data(&mut self) -> Result<()> {
        let words = self.read_block(CellTelemetry::ADDRESS, CellTelemetry::QUANTITY)?;
        let telemetry = CellTelemetry::decode_from_holding_registers(
            &words,
            self.snapshot.cell_count(),
            self.snapshot.temp_count(),
        )?;
        self.snapshot.update_cells(&telemetry.cell_voltages);
        self.snapshot.update_temperatures(&telemetry.temperatures);
        log::debug!("Cell voltage sum={}V", self.snapshot.cell_voltage_sum());
        Ok(())
    }

    /// Reads the charge/discharge limits. On failure the previous limits are kept.
    pub fn read_limits(&mut self) -> Result<()> {
        let words = self.read_block(Limits::ADDRESS, Limits::QUANTITY)?;
        self.snapshot.limits =
            Limits::decode_from_holding_registers(&words, &self.safety, CELL_COUNT)?;
        Ok(())
    }

    /// Reads SOC, pack voltage/current and the status registers.
    /// On failure the previous values are kept.
    pub fn read_pack_status(&mut self) -> Result<()> {
        let words = self.read_block(PackStatus::ADDRESS, PackStatus::QUANTITY)?;
        let pack = PackStatus::decode_from_holding_registers(&words)?;
        self.snapshot.temp_mos = Some(pack.bms_temperature);
        log::debug!("Pack status {:?}", pack);
        self.snapshot.pack = pack;
        Ok(())
    }

    /// Recomputes protection, permissions and currents from the values currently held.
    pub fn evaluate(&mut self) {
        let (protection, enable) =
            protection::evaluate(&self.snapshot.pack, &self.snapshot.limits);
        self.snapshot.protection = protection;
        self.snapshot.enable = enable;
        self.snapshot.control = CurrentControl::from(&self.snapshot.limits);
    }

    /// Reads every register block once and re-evaluates the protection.
    ///
    /// A failed block does not prevent reading the others; protection is evaluated in any case
    /// using the last values that were read successfully.
    pub fn poll(&mut self) -> PollReport {
        let cell_data = self.read_cell_data();
        let limits = self.read_limits();
        let pack_status = self.read_pack_status();
        self.evaluate();
        let report = PollReport {
            cell_data: log_outcome("cell data", cell_data),
            limits: log_outcome("limits", limits),
            pack_status: log_outcome("pack status", pack_status),
        };
        log::debug!("Poll slave={} {:?}", self.address, report);
        report
    }
}

fn log_outcome(block: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Cannot read {}: {}", block, e);
            false
        }
    }
}

impl<C: RegisterClient> BatteryDriver for FelicityEss<C> {
    fn test_connection(&mut self) -> Result<()> {
        log::info!("Start testing for Felicity ESS on slave address {}", self.address);
        for attempt in 1..=RETRY_COUNT {
            match self.read_firmware_version() {
                Ok(version) => {
                    log::info!("Felicity ESS firmware version {}", version);
                    self.snapshot.firmware_version = Some(version.0);
                    return Ok(());
                }
                Err(e) => log::debug!(
                    "Felicity ESS testing failed ({}) {}/{} on slave address {}",
                    e,
                    attempt,
                    RETRY_COUNT,
                    self.address
                ),
            }
        }
        log::error!("No Felicity ESS found on slave address {}", self.address);
        Err(Error::ConnectionNotFound {
            device: format!("slave address {}", self.address),
            attempts: RETRY_COUNT,
        })
    }

    fn refresh(&mut self) -> bool {
        self.poll().is_valid()
    }

    fn snapshot(&self) -> &BatterySnapshot {
        &self.snapshot
    }
}

/// Probes every candidate address once and returns the devices that answered.
pub fn scan<C, I>(client: &mut C, candidates: I) -> Vec<(Address, FirmwareVersion)>
where
    C: RegisterClient,
    I: IntoIterator<Item = Address>,
{
    candidates
        .into_iter()
        .filter_map(|address| {
            let found = client
                .read_holding_registers(
                    address,
                    FirmwareVersion::ADDRESS,
                    FirmwareVersion::QUANTITY,
                )
                .and_then(|words| FirmwareVersion::decode_from_holding_registers(&words));
            match found {
                Ok(version) => {
                    log::info!(
                        "Found device on slave address {} firmware version {}",
                        address,
                        version
                    );
                    Some((address, version))
                }
                Err(e) => {
                    log::debug!("No device on slave address {} ({})", address, e);
                    None
                }
            }
        })
        .collect()
}
