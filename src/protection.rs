//! Derives alarm states and charge/discharge permissions from decoded measurements.
//!
//! Every function here is a pure recomputation from the latest values; nothing is carried
//! over from a previous poll.

use crate::protocol::{FaultBit, Limits, PackStatus, StatusBit};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Severity of a single monitored condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProtectionState {
    Ok,
    Warning,
    Alarm,
}

impl ProtectionState {
    /// `Alarm` if `condition` holds, `Ok` otherwise.
    pub fn alarm_if(condition: bool) -> Self {
        if condition {
            Self::Alarm
        } else {
            Self::Ok
        }
    }
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtectionState::Ok => write!(f, "OK"),
            ProtectionState::Warning => write!(f, "WARNING"),
            ProtectionState::Alarm => write!(f, "ALARM"),
        }
    }
}

/// State of every monitored condition. `None` means the device family cannot report it.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtectionSnapshot {
    pub high_voltage: Option<ProtectionState>,
    pub low_voltage: Option<ProtectionState>,
    pub high_cell_voltage: Option<ProtectionState>,
    pub low_cell_voltage: Option<ProtectionState>,
    pub low_soc: Option<ProtectionState>,
    pub high_charge_current: Option<ProtectionState>,
    pub high_discharge_current: Option<ProtectionState>,
    pub high_charge_temp: Option<ProtectionState>,
    pub low_charge_temp: Option<ProtectionState>,
    pub high_temperature: Option<ProtectionState>,
    pub low_temperature: Option<ProtectionState>,
    pub high_internal_temp: Option<ProtectionState>,
    pub internal_failure: Option<ProtectionState>,
    pub cell_imbalance: Option<ProtectionState>,
    pub fuse_blown: Option<ProtectionState>,
}

impl ProtectionSnapshot {
    /// The most severe state of all reported conditions.
    pub fn worst(&self) -> ProtectionState {
        [
            self.high_voltage,
            self.low_voltage,
            self.high_cell_voltage,
            self.low_cell_voltage,
            self.low_soc,
            self.high_charge_current,
            self.high_discharge_current,
            self.high_charge_temp,
            self.low_charge_temp,
            self.high_temperature,
            self.low_temperature,
            self.high_internal_temp,
            self.internal_failure,
            self.cell_imbalance,
            self.fuse_blown,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(ProtectionState::Ok)
    }
}

/// Permission to charge and discharge the pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnableDecision {
    pub allow_charge: bool,
    pub allow_discharge: bool,
}

impl EnableDecision {
    /// State of the charge FET, which follows the charge permission.
    pub fn charge_fet(&self) -> bool {
        self.allow_charge
    }

    /// State of the discharge FET, which follows the discharge permission.
    pub fn discharge_fet(&self) -> bool {
        self.allow_discharge
    }

    /// Applies the overrides that hold for every device family: overtemperature disables
    /// both directions, a non-positive current limit disables its direction.
    pub fn restrict(self, overtemperature: bool, limits: &Limits) -> Self {
        Self {
            allow_charge: self.allow_charge && !overtemperature && limits.max_charge_current > 0.0,
            allow_discharge: self.allow_discharge
                && !overtemperature
                && limits.max_discharge_current > 0.0,
        }
    }
}

/// Currents the supervisor may currently draw or push.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CurrentControl {
    pub charge_current: f32,
    pub discharge_current: f32,
}

impl From<&Limits> for CurrentControl {
    fn from(limits: &Limits) -> Self {
        Self {
            charge_current: limits.max_charge_current,
            discharge_current: limits.max_discharge_current,
        }
    }
}

fn pack_voltage_states(pack_voltage: f32, limits: &Limits) -> (ProtectionState, ProtectionState) {
    (
        ProtectionState::alarm_if(pack_voltage >= limits.max_charge_voltage),
        ProtectionState::alarm_if(pack_voltage <= limits.min_discharge_voltage),
    )
}

/// Classifies the state of charge: empty is an alarm, below 10% a warning.
pub fn low_soc_state(soc_percent: f32) -> ProtectionState {
    if soc_percent <= 0.0 {
        ProtectionState::Alarm
    } else if soc_percent < 10.0 {
        ProtectionState::Warning
    } else {
        ProtectionState::Ok
    }
}

/// Evaluates the register-mapped status and fault bits of a Felicity ESS pack.
pub fn evaluate(status: &PackStatus, limits: &Limits) -> (ProtectionSnapshot, EnableDecision) {
    let fault = |bit: FaultBit| bit.is_set(status.fault_bits);
    let alarm = |bit: FaultBit| Some(ProtectionState::alarm_if(fault(bit)));
    let (high_voltage, low_voltage) = pack_voltage_states(status.pack_voltage, limits);

    let protection = ProtectionSnapshot {
        high_voltage: Some(high_voltage),
        low_voltage: Some(low_voltage),
        high_cell_voltage: alarm(FaultBit::CellVoltageHigh),
        low_cell_voltage: alarm(FaultBit::CellVoltageLow),
        low_soc: Some(low_soc_state(status.soc_percent)),
        high_charge_current: alarm(FaultBit::ChargeCurrentHigh),
        high_discharge_current: alarm(FaultBit::DischargeCurrentHigh),
        high_charge_temp: alarm(FaultBit::CellTemperatureHigh),
        low_charge_temp: alarm(FaultBit::CellTemperatureLow),
        high_temperature: alarm(FaultBit::CellTemperatureHigh),
        low_temperature: alarm(FaultBit::CellTemperatureLow),
        high_internal_temp: alarm(FaultBit::BmsTemperatureHigh),
        internal_failure: Some(ProtectionState::alarm_if(status.fault_bits != 0)),
        cell_imbalance: None,
        fuse_blown: None,
    };

    let overtemperature = FaultBit::OVERTEMPERATURE.into_iter().any(fault);
    let decision = EnableDecision {
        allow_charge: StatusBit::ChargeAllowed.is_set(status.status_bits)
            && !fault(FaultBit::CellVoltageHigh),
        allow_discharge: StatusBit::DischargeAllowed.is_set(status.status_bits)
            && !fault(FaultBit::CellVoltageLow),
    }
    .restrict(overtemperature, limits);

    if overtemperature {
        log::debug!("Overtemperature fault_bits={:#06X}", status.fault_bits);
    }
    (protection, decision)
}

/// Fault flags reported by the MNB analog front-end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AfeFaults {
    pub voltage_cell_high: bool,
    pub voltage_cell_low: bool,
    pub short: bool,
    pub ic_inspection: bool,
    pub software_lock: bool,
}

impl AfeFaults {
    /// Any fault of the front-end itself, as opposed to a cell voltage excursion.
    pub fn hardware_fault(&self) -> bool {
        self.short || self.ic_inspection || self.software_lock
    }

    pub fn any(&self) -> bool {
        self.voltage_cell_high || self.voltage_cell_low || self.hardware_fault()
    }

    /// Aggregated severity reported as cell imbalance: alarm as long as any flag is raised.
    pub fn cell_imbalance(&self) -> ProtectionState {
        ProtectionState::alarm_if(self.any())
    }
}

/// Temperature window of the MNB pack in °C.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TemperatureWindow {
    pub min: f32,
    pub max: f32,
}

/// Measurements of an MNB pack the protection is derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct AfeReading<'a> {
    pub pack_voltage: f32,
    pub soc_percent: f32,
    pub cell_min_voltage: f32,
    pub cell_max_voltage: f32,
    pub temperatures: &'a [f32],
    pub faults: AfeFaults,
}

/// Evaluates an MNB pack and reports whether a sensor is outside the temperature window.
/// The voltage based permissions come from [`taper_currents`].
pub fn evaluate_afe(
    reading: &AfeReading,
    limits: &Limits,
    window: TemperatureWindow,
) -> (ProtectionSnapshot, bool) {
    let hottest = reading
        .temperatures
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    let coldest = reading
        .temperatures
        .iter()
        .copied()
        .fold(f32::INFINITY, f32::min);
    let too_hot = !reading.temperatures.is_empty() && hottest > window.max;
    let too_cold = !reading.temperatures.is_empty() && coldest < window.min;
    let (high_voltage, low_voltage) = pack_voltage_states(reading.pack_voltage, limits);

    let protection = ProtectionSnapshot {
        high_voltage: Some(high_voltage),
        low_voltage: Some(low_voltage),
        high_cell_voltage: Some(ProtectionState::alarm_if(reading.faults.voltage_cell_high)),
        low_cell_voltage: Some(ProtectionState::alarm_if(reading.faults.voltage_cell_low)),
        low_soc: Some(low_soc_state(reading.soc_percent)),
        high_charge_current: None,
        high_discharge_current: None,
        high_charge_temp: Some(ProtectionState::alarm_if(too_hot)),
        low_charge_temp: Some(ProtectionState::alarm_if(too_cold)),
        high_temperature: Some(ProtectionState::alarm_if(too_hot)),
        low_temperature: Some(ProtectionState::alarm_if(too_cold)),
        high_internal_temp: None,
        internal_failure: Some(ProtectionState::alarm_if(reading.faults.hardware_fault())),
        cell_imbalance: Some(reading.faults.cell_imbalance()),
        fuse_blown: None,
    };
    (protection, too_hot || too_cold)
}

/// Voltage margin below the cell limit where the current starts to be reduced.
pub const TAPER_START: f32 = 0.15;
/// Voltage margin below the cell limit where the direction is switched off.
pub const TAPER_CUTOFF: f32 = 0.05;

fn taper_factor(margin: f32) -> f32 {
    (10.0 * (margin - TAPER_CUTOFF)).clamp(0.0, 1.0)
}

/// Reduces the permitted currents linearly as the extreme cells approach their voltage limits.
///
/// `margin` is the distance of the highest cell to `v_max` (resp. of the lowest cell to `v_min`).
/// Within [`TAPER_START`] of a limit the current scales down to zero at [`TAPER_CUTOFF`],
/// where the direction is no longer allowed.
pub fn taper_currents(
    cell_min_voltage: f32,
    cell_max_voltage: f32,
    v_min: f32,
    v_max: f32,
    limits: &Limits,
) -> (EnableDecision, CurrentControl) {
    let charge_margin = v_max - cell_max_voltage;
    let discharge_margin = cell_min_voltage - v_min;

    let decision = EnableDecision {
        allow_charge: charge_margin >= TAPER_CUTOFF,
        allow_discharge: discharge_margin >= TAPER_CUTOFF,
    };
    let control = CurrentControl {
        charge_current: if charge_margin < TAPER_START {
            limits.max_charge_current * taper_factor(charge_margin)
        } else {
            limits.max_charge_current
        },
        discharge_current: if discharge_margin < TAPER_START {
            limits.max_discharge_current * taper_factor(discharge_margin)
        } else {
            limits.max_discharge_current
        },
    };
    log::trace!(
        "Taper charge_margin={} discharge_margin={} control={:?}",
        charge_margin,
        discharge_margin,
        control
    );
    (decision, control)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            max_charge_voltage: 55.2,
            min_discharge_voltage: 46.4,
            max_charge_current: 50.0,
            max_discharge_current: 60.0,
        }
    }

    fn status(status_bits: u16, fault_bits: u16) -> PackStatus {
        PackStatus {
            soc_percent: 80.0,
            pack_voltage: 26.5,
            pack_current: 5.0,
            bms_temperature: 25.0,
            status_bits,
            fault_bits,
        }
    }

    #[test]
    fn nominal_pack_test() {
        let (protection, decision) = evaluate(&status(0b101, 0), &limits());
        assert!(decision.allow_charge);
        assert!(decision.allow_discharge);
        assert_eq!(decision.charge_fet(), decision.allow_charge);
        assert_eq!(decision.discharge_fet(), decision.allow_discharge);
        assert_eq!(protection.internal_failure, Some(ProtectionState::Ok));
        assert_eq!(protection.high_internal_temp, Some(ProtectionState::Ok));
        assert_eq!(protection.cell_imbalance, None);
        assert_eq!(protection.fuse_blown, None);
        // 26.5V is below the discharge floor of the 16S limits
        assert_eq!(protection.low_voltage, Some(ProtectionState::Alarm));
        assert_eq!(protection.high_voltage, Some(ProtectionState::Ok));
    }

    #[test]
    fn bms_overtemperature_test() {
        let (protection, decision) = evaluate(&status(0b101, 0b100_0000), &limits());
        assert!(!decision.allow_charge);
        assert!(!decision.allow_discharge);
        assert_eq!(protection.high_internal_temp, Some(ProtectionState::Alarm));
        assert_eq!(protection.internal_failure, Some(ProtectionState::Alarm));
    }

    #[test]
    fn overtemperature_overrides_status_test() {
        for bit in [6, 8, 9] {
            for status_bits in [0, 0b001, 0b100, 0b101, 0xFFFF] {
                let (_, decision) = evaluate(&status(status_bits, 1 << bit), &limits());
                assert!(!decision.allow_charge, "bit {bit} status {status_bits:#b}");
                assert!(!decision.allow_discharge, "bit {bit} status {status_bits:#b}");
            }
        }
    }

    #[test]
    fn temperature_bits_test() {
        let (protection, _) = evaluate(&status(0b101, 1 << 8), &limits());
        assert_eq!(protection.high_charge_temp, Some(ProtectionState::Alarm));
        assert_eq!(protection.high_temperature, Some(ProtectionState::Alarm));
        assert_eq!(protection.low_charge_temp, Some(ProtectionState::Ok));

        let (protection, _) = evaluate(&status(0b101, 1 << 9), &limits());
        assert_eq!(protection.low_charge_temp, Some(ProtectionState::Alarm));
        assert_eq!(protection.low_temperature, Some(ProtectionState::Alarm));
        assert_eq!(protection.high_temperature, Some(ProtectionState::Ok));
    }

    #[test]
    fn cell_voltage_bits_test() {
        let (protection, decision) = evaluate(&status(0b101, 1 << 2), &limits());
        assert!(!decision.allow_charge);
        assert!(decision.allow_discharge);
        assert_eq!(protection.high_cell_voltage, Some(ProtectionState::Alarm));

        let (protection, decision) = evaluate(&status(0b101, 1 << 3), &limits());
        assert!(decision.allow_charge);
        assert!(!decision.allow_discharge);
        assert_eq!(protection.low_cell_voltage, Some(ProtectionState::Alarm));
    }

    #[test]
    fn current_bits_do_not_disable_test() {
        let (protection, decision) = evaluate(&status(0b101, 0b11_0000), &limits());
        assert!(decision.allow_charge);
        assert!(decision.allow_discharge);
        assert_eq!(protection.high_charge_current, Some(ProtectionState::Alarm));
        assert_eq!(protection.high_discharge_current, Some(ProtectionState::Alarm));
        assert_eq!(protection.internal_failure, Some(ProtectionState::Alarm));
    }

    #[test]
    fn status_bits_test() {
        let (_, decision) = evaluate(&status(0b001, 0), &limits());
        assert!(decision.allow_charge);
        assert!(!decision.allow_discharge);
        let (_, decision) = evaluate(&status(0b100, 0), &limits());
        assert!(!decision.allow_charge);
        assert!(decision.allow_discharge);
    }

    #[test]
    fn non_positive_current_limit_test() {
        let mut limits = limits();
        limits.max_charge_current = 0.0;
        let (_, decision) = evaluate(&status(0b101, 0), &limits);
        assert!(!decision.allow_charge);
        assert!(decision.allow_discharge);

        limits.max_charge_current = 10.0;
        limits.max_discharge_current = -1.0;
        let (_, decision) = evaluate(&status(0b101, 0), &limits);
        assert!(decision.allow_charge);
        assert!(!decision.allow_discharge);
    }

    #[test]
    fn pack_voltage_test() {
        let mut pack = status(0b101, 0);
        pack.pack_voltage = 55.2;
        let (protection, _) = evaluate(&pack, &limits());
        assert_eq!(protection.high_voltage, Some(ProtectionState::Alarm));
        pack.pack_voltage = 50.0;
        let (protection, _) = evaluate(&pack, &limits());
        assert_eq!(protection.high_voltage, Some(ProtectionState::Ok));
        assert_eq!(protection.low_voltage, Some(ProtectionState::Ok));
        pack.pack_voltage = 46.4;
        let (protection, _) = evaluate(&pack, &limits());
        assert_eq!(protection.low_voltage, Some(ProtectionState::Alarm));
    }

    #[test]
    fn low_soc_test() {
        assert_eq!(low_soc_state(0.0), ProtectionState::Alarm);
        assert_eq!(low_soc_state(-1.0), ProtectionState::Alarm);
        assert_eq!(low_soc_state(1.0), ProtectionState::Warning);
        assert_eq!(low_soc_state(9.9), ProtectionState::Warning);
        assert_eq!(low_soc_state(10.0), ProtectionState::Ok);
        assert_eq!(low_soc_state(100.0), ProtectionState::Ok);
    }

    #[test]
    fn worst_state_test() {
        let (protection, _) = evaluate(&status(0b101, 0), &limits());
        assert_eq!(protection.worst(), ProtectionState::Alarm);
        assert_eq!(ProtectionSnapshot::default().worst(), ProtectionState::Ok);
        let snapshot = ProtectionSnapshot {
            low_soc: Some(ProtectionState::Warning),
            high_voltage: Some(ProtectionState::Ok),
            ..Default::default()
        };
        assert_eq!(snapshot.worst(), ProtectionState::Warning);
    }

    #[test]
    fn afe_cell_imbalance_test() {
        assert_eq!(AfeFaults::default().cell_imbalance(), ProtectionState::Ok);
        let flags = [
            AfeFaults {
                voltage_cell_high: true,
                ..Default::default()
            },
            AfeFaults {
                voltage_cell_low: true,
                ..Default::default()
            },
            AfeFaults {
                short: true,
                ..Default::default()
            },
            AfeFaults {
                ic_inspection: true,
                ..Default::default()
            },
            AfeFaults {
                software_lock: true,
                ..Default::default()
            },
        ];
        for faults in flags {
            assert_eq!(faults.cell_imbalance(), ProtectionState::Alarm, "{faults:?}");
        }
        // a cleared voltage flag does not hide a remaining hardware flag
        let faults = AfeFaults {
            voltage_cell_high: false,
            short: true,
            ..Default::default()
        };
        assert_eq!(faults.cell_imbalance(), ProtectionState::Alarm);
        assert!(faults.hardware_fault());
    }

    #[test]
    fn evaluate_afe_test() {
        let limits = Limits {
            max_charge_voltage: 29.2,
            min_discharge_voltage: 20.4,
            max_charge_current: 129.6,
            max_discharge_current: 129.6,
        };
        let window = TemperatureWindow { min: 15.0, max: 40.0 };
        let temperatures = [20.0, 25.0, 41.0];
        let reading = AfeReading {
            pack_voltage: 26.4,
            soc_percent: 50.0,
            cell_min_voltage: 3.3,
            cell_max_voltage: 3.3,
            temperatures: &temperatures,
            faults: AfeFaults {
                software_lock: true,
                ..Default::default()
            },
        };
        let (protection, overtemperature) = evaluate_afe(&reading, &limits, window);
        assert!(overtemperature);
        assert_eq!(protection.high_temperature, Some(ProtectionState::Alarm));
        assert_eq!(protection.low_charge_temp, Some(ProtectionState::Ok));
        assert_eq!(protection.internal_failure, Some(ProtectionState::Alarm));
        assert_eq!(protection.cell_imbalance, Some(ProtectionState::Alarm));
        assert_eq!(protection.high_voltage, Some(ProtectionState::Ok));
        assert_eq!(protection.low_voltage, Some(ProtectionState::Ok));
        assert_eq!(protection.fuse_blown, None);

        let reading = AfeReading { temperatures: &[], faults: AfeFaults::default(), ..reading };
        let (protection, overtemperature) = evaluate_afe(&reading, &limits, window);
        assert!(!overtemperature);
        assert_eq!(protection.worst(), ProtectionState::Ok);
    }

    #[test]
    fn taper_full_current_test() {
        let (decision, control) = taper_currents(3.3, 3.3, 2.55, 3.65, &limits());
        assert!(decision.allow_charge);
        assert!(decision.allow_discharge);
        assert_eq!(control.charge_current, 50.0);
        assert_eq!(control.discharge_current, 60.0);
    }

    #[test]
    fn taper_near_max_cell_voltage_test() {
        // 0.1V below the limit: half of the current
        let (decision, control) = taper_currents(3.3, 3.55, 2.55, 3.65, &limits());
        assert!(decision.allow_charge);
        assert!((control.charge_current - 25.0).abs() < 1e-3);
        assert_eq!(control.discharge_current, 60.0);

        // within the cutoff margin charging stops
        let (decision, control) = taper_currents(3.3, 3.62, 2.55, 3.65, &limits());
        assert!(!decision.allow_charge);
        assert_eq!(control.charge_current, 0.0);
    }

    #[test]
    fn taper_near_min_cell_voltage_test() {
        let (decision, control) = taper_currents(2.65, 3.3, 2.55, 3.65, &limits());
        assert!(decision.allow_discharge);
        assert!((control.discharge_current - 30.0).abs() < 1e-3);

        let (decision, control) = taper_currents(2.58, 3.3, 2.55, 3.65, &limits());
        assert!(!decision.allow_discharge);
        assert_eq!(control.discharge_current, 0.0);
        assert!(decision.allow_charge);
    }

    #[test]
    fn taper_is_monotonic_test() {
        let mut previous = f32::MAX;
        for step in 0..=20 {
            let cell_max = 3.45 + step as f32 * 0.01;
            let (_, control) = taper_currents(3.0, cell_max, 2.55, 3.65, &limits());
            assert!(control.charge_current <= previous);
            previous = control.charge_current;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn restrict_test() {
        let open = EnableDecision {
            allow_charge: true,
            allow_discharge: true,
        };
        assert_eq!(open.restrict(false, &limits()), open);
        assert_eq!(open.restrict(true, &limits()), EnableDecision::default());
    }
}
