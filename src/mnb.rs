//! Driver for MNB lithium packs whose cells are monitored by an SPI analog front-end.
//!
//! The front-end itself (SPI bus, chip initialisation, ADC conversion) is provided by an
//! [`AfeSampler`]; this driver turns its samples into a [`BatterySnapshot`].

use crate::battery::{BatteryDriver, BatterySnapshot};
use crate::protection::{self, AfeFaults, AfeReading, TemperatureWindow};
use crate::protocol::{Limits, PackStatus};
use crate::{Error, Result};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const BATTERY_TYPE: &str = "MNB-Li SPI";

/// Fixed parameters of an MNB pack.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MnbSettings {
    /// Equivalent cell capacity in Ah.
    pub capacity_ah: f32,
    /// Max current per Ah, e.g. 1, 0.5 or 0.25.
    pub c_rating: f32,
    pub cell_min_voltage: f32,
    pub cell_max_voltage: f32,
    pub cell_count: usize,
    pub temp_sensors: usize,
    pub temperature_window: TemperatureWindow,
    pub poll_interval: Duration,
    pub version: String,
}

impl Default for MnbSettings {
    fn default() -> Self {
        Self {
            capacity_ah: 36.0 * 3.6,
            c_rating: 1.0,
            cell_min_voltage: 2.55,
            cell_max_voltage: 3.65,
            cell_count: 8,
            temp_sensors: 6,
            temperature_window: TemperatureWindow {
                min: 15.0,
                max: 40.0,
            },
            poll_interval: Duration::from_millis(1000),
            version: "V2.01".to_string(),
        }
    }
}

impl MnbSettings {
    pub fn max_current(&self) -> f32 {
        self.capacity_ah * self.c_rating
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_charge_voltage: self.cell_max_voltage * self.cell_count as f32,
            min_discharge_voltage: self.cell_min_voltage * self.cell_count as f32,
            max_charge_current: self.max_current(),
            max_discharge_current: self.max_current(),
        }
    }

    pub fn hardware_version(&self) -> String {
        format!("MNB_BMS {}S", self.cell_count)
    }
}

/// One acquisition cycle of the analog front-end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AfeSample {
    pub cell_voltages: Vec<f32>,
    pub temperatures: Vec<f32>,
    /// Pack current in A, positive while charging.
    pub current: f32,
    pub soc_percent: f32,
    pub faults: AfeFaults,
}

/// Access to the cell monitoring chip.
pub trait AfeSampler {
    /// Configures the chip for `settings`. Called from [`BatteryDriver::test_connection`].
    fn init(&mut self, settings: &MnbSettings) -> Result<()>;

    /// Runs one acquisition cycle.
    fn sample(&mut self) -> Result<AfeSample>;
}

#[derive(Debug)]
pub struct Mnb<S: AfeSampler> {
    sampler: S,
    settings: MnbSettings,
    faults: AfeFaults,
    snapshot: BatterySnapshot,
}

impl<S: AfeSampler> Mnb<S> {
    pub fn new(sampler: S, settings: MnbSettings, identifier: String) -> Self {
        let snapshot = BatterySnapshot::new(
            BATTERY_TYPE,
            identifier,
            settings.cell_count,
            settings.temp_sensors,
            settings.limits(),
        );
        Self {
            sampler,
            settings,
            faults: AfeFaults::default(),
            snapshot,
        }
    }

    pub fn settings(&self) -> &MnbSettings {
        &self.settings
    }

    pub fn faults(&self) -> AfeFaults {
        self.faults
    }

    /// Takes one sample and stores it. A sample with the wrong number of cells or sensors
    /// is rejected as a whole.
    pub fn read_sample(&mut self) -> Result<()> {
        let sample = self.sampler.sample()?;
        for (received, required) in [
            (sample.cell_voltages.len(), self.snapshot.cell_count()),
            (sample.temperatures.len(), self.snapshot.temp_count()),
        ] {
            if received != required {
                log::warn!(
                    "Invalid sample size - required={} received={}",
                    required,
                    received
                );
                return Err(if received < required {
                    Error::ShortRead { required, received }
                } else {
                    Error::SizeMismatch { required, received }
                });
            }
        }
        self.snapshot.update_cells(&sample.cell_voltages);
        self.snapshot.update_temperatures(&sample.temperatures);
        let hottest = self
            .snapshot
            .temperatures
            .iter()
            .map(|t| t.value_celsius)
            .reduce(f32::max);
        self.snapshot.pack = PackStatus {
            soc_percent: sample.soc_percent,
            pack_voltage: self.snapshot.cell_voltage_sum(),
            pack_current: sample.current,
            bms_temperature: hottest.unwrap_or_default(),
            status_bits: 0,
            fault_bits: 0,
        };
        self.faults = sample.faults;
        log::trace!("MNB sample {:?}", sample);
        Ok(())
    }

    /// Recomputes protection, permissions and tapered currents from the values currently held.
    pub fn evaluate(&mut self) {
        let limits = &self.snapshot.limits;
        let cell_min_voltage = self.snapshot.cell_min_voltage().unwrap_or_default();
        let cell_max_voltage = self.snapshot.cell_max_voltage().unwrap_or_default();
        let temperatures: Vec<f32> = self
            .snapshot
            .temperatures
            .iter()
            .map(|t| t.value_celsius)
            .collect();
        let reading = AfeReading {
            pack_voltage: self.snapshot.pack.pack_voltage,
            soc_percent: self.snapshot.pack.soc_percent,
            cell_min_voltage,
            cell_max_voltage,
            temperatures: &temperatures,
            faults: self.faults,
        };
        let (protection, out_of_window) =
            protection::evaluate_afe(&reading, limits, self.settings.temperature_window);
        let (decision, control) = protection::taper_currents(
            cell_min_voltage,
            cell_max_voltage,
            self.settings.cell_min_voltage,
            self.settings.cell_max_voltage,
            limits,
        );
        self.snapshot.enable = decision.restrict(out_of_window, limits);
        self.snapshot.control = control;
        self.snapshot.protection = protection;
    }
}

impl<S: AfeSampler> BatteryDriver for Mnb<S> {
    fn test_connection(&mut self) -> Result<()> {
        let result = self
            .sampler
            .init(&self.settings)
            .and_then(|_| self.read_sample());
        match result {
            Ok(()) => {
                log::info!(
                    "Found {} {}",
                    self.settings.hardware_version(),
                    self.settings.version
                );
                self.evaluate();
                Ok(())
            }
            Err(e) => {
                log::error!("No MNB found on {} ({})", self.snapshot.identifier, e);
                Err(Error::ConnectionNotFound {
                    device: self.snapshot.identifier.clone(),
                    attempts: 1,
                })
            }
        }
    }

    fn refresh(&mut self) -> bool {
        let result = self.read_sample();
        self.evaluate();
        match result {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Cannot read MNB sample: {}", e);
                false
            }
        }
    }

    fn snapshot(&self) -> &BatterySnapshot {
        &self.snapshot
    }

    fn min_poll_interval(&self) -> Option<Duration> {
        Some(self.settings.poll_interval)
    }
}
