use crate::protection::{CurrentControl, EnableDecision, ProtectionSnapshot};
use crate::protocol::{Limits, PackStatus};
use crate::Result;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Temperature every sensor starts with. It is low enough to keep charging and
/// discharging disabled until a real reading arrives.
pub const TEMPERATURE_SENTINEL: f32 = -10.0;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cell {
    pub index: usize,
    pub voltage: f32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TemperatureReading {
    pub sensor_index: usize,
    pub value_celsius: f32,
}

/// Everything known about a battery after the latest poll.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatterySnapshot {
    pub battery_type: String,
    /// Distinguishes several batteries of the same type, e.g. the bus address.
    pub identifier: String,
    pub firmware_version: Option<u16>,
    pub cells: Vec<Cell>,
    pub temperatures: Vec<TemperatureReading>,
    pub temp1: Option<f32>,
    pub temp2: Option<f32>,
    pub temp3: Option<f32>,
    pub temp4: Option<f32>,
    pub temp_mos: Option<f32>,
    pub pack: PackStatus,
    pub limits: Limits,
    pub protection: ProtectionSnapshot,
    pub enable: EnableDecision,
    pub control: CurrentControl,
}

impl BatterySnapshot {
    /// Creates a snapshot with `cell_count` cells at 0V and `temp_count` sensors at
    /// [`TEMPERATURE_SENTINEL`]. The number of cells and sensors never changes afterwards.
    pub fn new(
        battery_type: &str,
        identifier: String,
        cell_count: usize,
        temp_count: usize,
        limits: Limits,
    ) -> Self {
        Self {
            battery_type: battery_type.to_string(),
            identifier,
            firmware_version: None,
            cells: (0..cell_count)
                .map(|index| Cell {
                    index,
                    voltage: 0.0,
                })
                .collect(),
            temperatures: (0..temp_count)
                .map(|sensor_index| TemperatureReading {
                    sensor_index,
                    value_celsius: TEMPERATURE_SENTINEL,
                })
                .collect(),
            temp1: None,
            temp2: None,
            temp3: None,
            temp4: None,
            temp_mos: None,
            pack: PackStatus::default(),
            control: CurrentControl::from(&limits),
            limits,
            protection: ProtectionSnapshot::default(),
            enable: EnableDecision::default(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn temp_count(&self) -> usize {
        self.temperatures.len()
    }

    /// Overwrites the cell voltages in place. `voltages` must hold one value per cell.
    pub(crate) fn update_cells(&mut self, voltages: &[f32]) {
        debug_assert_eq!(voltages.len(), self.cells.len());
        for (cell, voltage) in self.cells.iter_mut().zip(voltages) {
            cell.voltage = *voltage;
        }
    }

    /// Overwrites the sensor temperatures in place and refreshes the primary aliases.
    pub(crate) fn update_temperatures(&mut self, temperatures: &[f32]) {
        debug_assert_eq!(temperatures.len(), self.temperatures.len());
        for (reading, value) in self.temperatures.iter_mut().zip(temperatures) {
            reading.value_celsius = *value;
        }
        let alias = |n: usize| temperatures.get(n).copied();
        self.temp1 = alias(0);
        self.temp2 = alias(1);
        self.temp3 = alias(2);
        self.temp4 = alias(3);
    }

    /// Sum of all cell voltages.
    pub fn cell_voltage_sum(&self) -> f32 {
        self.cells.iter().map(|cell| cell.voltage).sum()
    }

    pub fn cell_min_voltage(&self) -> Option<f32> {
        self.cells.iter().map(|cell| cell.voltage).reduce(f32::min)
    }

    pub fn cell_max_voltage(&self) -> Option<f32> {
        self.cells.iter().map(|cell| cell.voltage).reduce(f32::max)
    }
}

/// A battery management system of one device family.
pub trait BatteryDriver {
    /// Checks that the device answers. Called once before polling starts.
    fn test_connection(&mut self) -> Result<()>;

    /// Runs one poll cycle. Returns `true` if every part of the snapshot was refreshed;
    /// parts that could not be read keep their previous values.
    fn refresh(&mut self) -> bool;

    fn snapshot(&self) -> &BatterySnapshot;

    fn unique_identifier(&self) -> &str {
        &self.snapshot().identifier
    }

    /// Shortest interval between two poll cycles the device keeps up with.
    fn min_poll_interval(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SafetyLimits;

    fn snapshot() -> BatterySnapshot {
        BatterySnapshot::new(
            "test",
            "1".to_string(),
            4,
            6,
            SafetyLimits::default().limits(4),
        )
    }

    #[test]
    fn new_snapshot_test() {
        let snapshot = snapshot();
        assert_eq!(snapshot.cell_count(), 4);
        assert_eq!(snapshot.temp_count(), 6);
        assert!(snapshot
            .temperatures
            .iter()
            .all(|t| t.value_celsius == TEMPERATURE_SENTINEL));
        assert_eq!(snapshot.temp1, None);
        assert_eq!(snapshot.control.charge_current, 50.0);
        assert_eq!(snapshot.enable, EnableDecision::default());
    }

    #[test]
    fn update_test() {
        let mut snapshot = snapshot();
        snapshot.update_cells(&[3.2, 3.4, 3.3, 3.1]);
        snapshot.update_temperatures(&[20.0, 21.0, 22.0, 23.0, 24.0, 25.0]);
        assert_eq!(snapshot.cells[1].voltage, 3.4);
        assert_eq!(snapshot.cells[1].index, 1);
        assert_eq!(snapshot.cell_min_voltage(), Some(3.1));
        assert_eq!(snapshot.cell_max_voltage(), Some(3.4));
        assert!((snapshot.cell_voltage_sum() - 13.0).abs() < 1e-5);
        assert_eq!(
            (snapshot.temp1, snapshot.temp2, snapshot.temp3, snapshot.temp4),
            (Some(20.0), Some(21.0), Some(22.0), Some(23.0))
        );
        assert_eq!(snapshot.temperatures[5].value_celsius, 25.0);
    }

    #[test]
    fn empty_cells_test() {
        let limits = SafetyLimits::default().limits(0);
        let snapshot = BatterySnapshot::new("test", "0".into(), 0, 0, limits);
        assert_eq!(snapshot.cell_min_voltage(), None);
        assert_eq!(snapshot.cell_max_voltage(), None);
    }
}
