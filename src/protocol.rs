use crate::{Error, Result};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 16-bit value stored in a Modbus holding register.
pub type Word = u16;

/// Modbus function code used for every block read.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(4);

/// Default per-read timeout of the serial transport.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(400);

macro_rules! read_bit {
    ($word:expr,$position:expr) => {
        ($word >> $position) & 1 != 0
    };
}

/// Returns whether bit `position` of `word` is set.
pub fn is_bit_set(word: Word, position: u8) -> bool {
    read_bit!(word, position)
}

fn validate_len(words: &[Word], required: usize) -> Result<()> {
    if words.len() < required {
        log::warn!(
            "Invalid register count - required={} received={}",
            required,
            words.len()
        );
        return Err(Error::ShortRead {
            required,
            received: words.len(),
        });
    }
    Ok(())
}

/// Returns `candidate`, lowered to `ceiling` if it is more permissive.
pub fn cap_at(candidate: f32, ceiling: f32) -> f32 {
    if candidate > ceiling {
        log::debug!("Capping value={} ceiling={}", candidate, ceiling);
        ceiling
    } else {
        candidate
    }
}

/// Returns `candidate`, raised to `floor` if it is more permissive.
pub fn raise_to(candidate: f32, floor: f32) -> f32 {
    if candidate < floor {
        log::debug!("Raising value={} floor={}", candidate, floor);
        floor
    } else {
        candidate
    }
}

/// Modbus RTU address of a BMS on the RS485 bus.
/// The address must be in the range from 1 to 247.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address(u8);

impl std::ops::Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for Address {
    fn default() -> Self {
        Self(0x01)
    }
}

impl Address {
    /// Minimum valid Modbus device address.
    pub const MIN: u8 = 1;
    /// Maximum valid Modbus device address.
    pub const MAX: u8 = 247;
}

/// Error indicating that the address value is out of range.
#[derive(thiserror::Error, Debug)]
#[error(
    "The address value {0} is outside the valid range of {min} to {max}",
    min = Address::MIN,
    max = Address::MAX
)]
pub struct ErrorAddressOutOfRange(u8);

impl TryFrom<u8> for Address {
    type Error = ErrorAddressOutOfRange;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ErrorAddressOutOfRange(value))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Blocking reader of Modbus holding registers.
///
/// The transport (serial port setup, framing, CRC, timeouts) lives behind this trait.
/// A timeout or a malformed frame must surface as an `Err`, never as a panic.
pub trait RegisterClient {
    /// Reads `quantity` registers of device `slave` starting at `address`.
    ///
    /// Implementations may return fewer words than requested when the device sends a short reply;
    /// the decoders treat that as [`Error::ShortRead`].
    fn read_holding_registers(&mut self, slave: Address, address: u16, quantity: u16)
        -> Result<Vec<Word>>;
}

impl<T: RegisterClient + ?Sized> RegisterClient for &mut T {
    fn read_holding_registers(
        &mut self,
        slave: Address,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<Word>> {
        (**self).read_holding_registers(slave, address, quantity)
    }
}

/// Firmware version register, used to detect the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FirmwareVersion(pub Word);

impl FirmwareVersion {
    pub const ADDRESS: u16 = 0xF80B;
    pub const QUANTITY: u16 = 1;

    pub fn decode_from_holding_registers(words: &[Word]) -> Result<Self> {
        validate_len(words, Self::QUANTITY as usize)?;
        Ok(Self(words[0]))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

/// Per-cell voltages followed by per-sensor temperatures.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellTelemetry {
    pub cell_voltages: Vec<f32>,
    pub temperatures: Vec<f32>,
}

impl CellTelemetry {
    pub const ADDRESS: u16 = 0x132A;
    /// 16 cell voltages and 8 temperature sensors.
    pub const QUANTITY: u16 = 0x18;

    /// Decodes `cell_count` voltages (mV) and `temp_count` temperatures (whole °C).
    ///
    /// Fails with [`Error::ShortRead`] if `words` holds fewer than `cell_count + temp_count`
    /// values.
    pub fn decode_from_holding_registers(
        words: &[Word],
        cell_count: usize,
        temp_count: usize,
    ) -> Result<Self> {
        validate_len(words, cell_count + temp_count)?;
        let cell_voltages = words[..cell_count]
            .iter()
            .enumerate()
            .map(|(n_cell, word)| {
                let volt = *word as f32 / 1000.0;
                log::trace!("Cell #{} volt={}", n_cell, volt);
                volt
            })
            .collect();
        let temperatures = words[cell_count..cell_count + temp_count]
            .iter()
            .enumerate()
            .map(|(n_sensor, word)| {
                // Negative temperatures are transferred as two's complement
                let temperature = *word as i16 as f32;
                log::trace!("Sensor #{} °C={}", n_sensor, temperature);
                temperature
            })
            .collect();
        Ok(Self {
            cell_voltages,
            temperatures,
        })
    }
}

/// Configured absolute bounds the device limits are clamped against.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SafetyLimits {
    pub max_cell_voltage: f32,
    pub min_cell_voltage: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_cell_voltage: 3.45,
            min_cell_voltage: 2.9,
            max_charge_current: 50.0,
            max_discharge_current: 60.0,
        }
    }
}

impl SafetyLimits {
    /// Highest permitted pack voltage for `cell_count` cells in series.
    pub fn max_pack_voltage(&self, cell_count: usize) -> f32 {
        self.max_cell_voltage * cell_count as f32
    }

    /// Lowest permitted pack voltage for `cell_count` cells in series.
    pub fn min_pack_voltage(&self, cell_count: usize) -> f32 {
        self.min_cell_voltage * cell_count as f32
    }

    /// The most permissive limits allowed for a pack of `cell_count` cells.
    pub fn limits(&self, cell_count: usize) -> Limits {
        Limits {
            max_charge_voltage: self.max_pack_voltage(cell_count),
            min_discharge_voltage: self.min_pack_voltage(cell_count),
            max_charge_current: self.max_charge_current,
            max_discharge_current: self.max_discharge_current,
        }
    }
}

/// Charge and discharge limits of the pack.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Limits {
    pub max_charge_voltage: f32,
    pub min_discharge_voltage: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
}

impl Limits {
    pub const ADDRESS: u16 = 0x131C;
    pub const QUANTITY: u16 = 0x04;

    /// Decodes the device limits and clamps them so none is more permissive than `safety`.
    pub fn decode_from_holding_registers(
        words: &[Word],
        safety: &SafetyLimits,
        cell_count: usize,
    ) -> Result<Self> {
        validate_len(words, Self::QUANTITY as usize)?;
        // voltages in 0.01V, currents in 0.1A
        Ok(Self {
            max_charge_voltage: cap_at(
                words[0] as f32 / 100.0,
                safety.max_pack_voltage(cell_count),
            ),
            min_discharge_voltage: raise_to(
                words[1] as f32 / 100.0,
                safety.min_pack_voltage(cell_count),
            ),
            max_charge_current: cap_at(words[2] as f32 / 10.0, safety.max_charge_current),
            max_discharge_current: cap_at(words[3] as f32 / 10.0, safety.max_discharge_current),
        })
    }
}

/// Bits of the battery status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum StatusBit {
    ChargeAllowed = 0,
    DischargeAllowed = 2,
}

impl StatusBit {
    pub fn is_set(self, status_bits: Word) -> bool {
        is_bit_set(status_bits, self as u8)
    }
}

/// Bits of the battery fault register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum FaultBit {
    CellVoltageHigh = 2,
    CellVoltageLow = 3,
    ChargeCurrentHigh = 4,
    DischargeCurrentHigh = 5,
    BmsTemperatureHigh = 6,
    CellTemperatureHigh = 8,
    CellTemperatureLow = 9,
}

impl FaultBit {
    pub const ALL: [FaultBit; 7] = [
        FaultBit::CellVoltageHigh,
        FaultBit::CellVoltageLow,
        FaultBit::ChargeCurrentHigh,
        FaultBit::DischargeCurrentHigh,
        FaultBit::BmsTemperatureHigh,
        FaultBit::CellTemperatureHigh,
        FaultBit::CellTemperatureLow,
    ];

    /// Faults that switch off charging and discharging regardless of anything else.
    pub const OVERTEMPERATURE: [FaultBit; 3] = [
        FaultBit::BmsTemperatureHigh,
        FaultBit::CellTemperatureHigh,
        FaultBit::CellTemperatureLow,
    ];

    pub fn is_set(self, fault_bits: Word) -> bool {
        is_bit_set(fault_bits, self as u8)
    }

    /// All known faults set in `fault_bits`.
    pub fn decode(fault_bits: Word) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|bit| bit.is_set(fault_bits))
            .collect()
    }
}

impl fmt::Display for FaultBit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultBit::CellVoltageHigh => write!(f, "Cell voltage is too high"),
            FaultBit::CellVoltageLow => write!(f, "Cell voltage is too low"),
            FaultBit::ChargeCurrentHigh => write!(f, "Charge over current"),
            FaultBit::DischargeCurrentHigh => write!(f, "Discharge over current"),
            FaultBit::BmsTemperatureHigh => write!(f, "BMS overtemperature"),
            FaultBit::CellTemperatureHigh => write!(f, "Cell temperature too high"),
            FaultBit::CellTemperatureLow => write!(f, "Cell temperature too low"),
        }
    }
}

/// Pack level measurements and the raw status and fault registers.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PackStatus {
    pub soc_percent: f32,
    pub pack_voltage: f32,
    pub pack_current: f32, // negative=discharging, positive=charging
    pub bms_temperature: f32,
    pub status_bits: Word,
    pub fault_bits: Word,
}

impl PackStatus {
    pub const ADDRESS: u16 = 0x1302;
    pub const QUANTITY: u16 = 0x0A;

    pub fn decode_from_holding_registers(words: &[Word]) -> Result<Self> {
        validate_len(words, Self::QUANTITY as usize)?;
        // Words 1, 3, 6 and 7 are reserved
        Ok(Self {
            status_bits: words[0],
            fault_bits: words[2],
            pack_voltage: words[4] as f32 / 100.0,
            pack_current: words[5] as i16 as f32 / 10.0,
            bms_temperature: words[8] as i16 as f32,
            soc_percent: words[9] as f32,
        })
    }

    pub fn faults(&self) -> Vec<FaultBit> {
        FaultBit::decode(self.fault_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_pack_words() -> Vec<Word> {
        vec![0b101, 0, 0, 0, 2650, 50, 0, 0, 25, 80]
    }

    #[test]
    fn bit_test() {
        assert!(is_bit_set(0b101, 0));
        assert!(!is_bit_set(0b101, 1));
        assert!(is_bit_set(0b101, 2));
        assert!(is_bit_set(0x8000, 15));
    }

    #[test]
    fn address_test() {
        assert!(matches!(
            Address::try_from(Address::MIN - 1),
            Err(ErrorAddressOutOfRange(..))
        ));
        assert!(matches!(Address::try_from(1), Ok(..)));
        assert!(matches!(Address::try_from(247), Ok(..)));
        assert!(matches!(
            Address::try_from(Address::MAX + 1),
            Err(ErrorAddressOutOfRange(..))
        ));
        assert_eq!(*Address::default(), 1);
    }

    #[test]
    fn cell_telemetry_test() {
        let mut words = vec![3300; 16];
        words.extend([20, 21, 22, 23]);
        words.extend([(-10i16) as u16; 4]);
        let telemetry = CellTelemetry::decode_from_holding_registers(&words, 16, 8).unwrap();
        assert_eq!(telemetry.cell_voltages, vec![3.3; 16]);
        assert_eq!(
            telemetry.temperatures,
            vec![20.0, 21.0, 22.0, 23.0, -10.0, -10.0, -10.0, -10.0]
        );

        // decoding the same block again yields exactly the same values
        let again = CellTelemetry::decode_from_holding_registers(&words, 16, 8).unwrap();
        assert_eq!(telemetry, again);
    }

    #[test]
    fn cell_telemetry_exact_scaling_test() {
        let words: Vec<Word> = (0..24).map(|i| 2500 + i * 37).collect();
        let telemetry = CellTelemetry::decode_from_holding_registers(&words, 16, 8).unwrap();
        for (word, volt) in words.iter().zip(telemetry.cell_voltages.iter()) {
            assert_eq!(*volt, *word as f32 / 1000.0);
        }
        for (word, temperature) in words[16..].iter().zip(telemetry.temperatures.iter()) {
            assert_eq!(*temperature, *word as f32);
        }
    }

    #[test]
    fn cell_telemetry_short_read_test() {
        assert!(matches!(
            CellTelemetry::decode_from_holding_registers(&[3300, 3300, 3300], 16, 8),
            Err(Error::ShortRead {
                required: 24,
                received: 3
            })
        ));
        // extra words are ignored
        let words = vec![3000; 30];
        let telemetry = CellTelemetry::decode_from_holding_registers(&words, 16, 8).unwrap();
        assert_eq!(telemetry.cell_voltages.len(), 16);
        assert_eq!(telemetry.temperatures.len(), 8);
    }

    #[test]
    fn limits_within_bounds_test() {
        let safety = SafetyLimits::default();
        let limits = Limits::decode_from_holding_registers(&[5400, 4800, 300, 400], &safety, 16)
            .unwrap();
        assert_eq!(limits.max_charge_voltage, 54.0);
        assert_eq!(limits.min_discharge_voltage, 48.0);
        assert_eq!(limits.max_charge_current, 30.0);
        assert_eq!(limits.max_discharge_current, 40.0);
    }

    #[test]
    fn limits_clamped_test() {
        let safety = SafetyLimits::default();
        let limits = Limits::decode_from_holding_registers(&[6000, 100, 2000, 2000], &safety, 16)
            .unwrap();
        assert_eq!(limits.max_charge_voltage, safety.max_cell_voltage * 16.0);
        assert_eq!(limits.min_discharge_voltage, safety.min_cell_voltage * 16.0);
        assert_eq!(limits.max_charge_current, safety.max_charge_current);
        assert_eq!(limits.max_discharge_current, safety.max_discharge_current);
    }

    #[test]
    fn limits_short_read_test() {
        assert!(matches!(
            Limits::decode_from_holding_registers(&[5400, 4800], &SafetyLimits::default(), 16),
            Err(Error::ShortRead {
                required: 4,
                received: 2
            })
        ));
    }

    #[test]
    fn pack_status_test() {
        let status = PackStatus::decode_from_holding_registers(&scenario_pack_words()).unwrap();
        assert_eq!(status.soc_percent, 80.0);
        assert_eq!(status.pack_voltage, 26.5);
        assert_eq!(status.pack_current, 5.0);
        assert_eq!(status.bms_temperature, 25.0);
        assert_eq!(status.status_bits, 0b101);
        assert_eq!(status.fault_bits, 0);
        assert!(status.faults().is_empty());
    }

    #[test]
    fn pack_status_negative_current_test() {
        let mut words = scenario_pack_words();
        words[5] = (-125i16) as u16;
        let status = PackStatus::decode_from_holding_registers(&words).unwrap();
        assert_eq!(status.pack_current, -12.5);
    }

    #[test]
    fn pack_status_short_read_test() {
        assert!(matches!(
            PackStatus::decode_from_holding_registers(&scenario_pack_words()[..9]),
            Err(Error::ShortRead {
                required: 10,
                received: 9
            })
        ));
    }

    #[test]
    fn fault_bits_test() {
        assert_eq!(
            FaultBit::decode(0b11_0100_0100),
            vec![
                FaultBit::CellVoltageHigh,
                FaultBit::BmsTemperatureHigh,
                FaultBit::CellTemperatureHigh,
                FaultBit::CellTemperatureLow
            ]
        );
        // unknown bits are ignored
        assert!(FaultBit::decode(0b1000_0000_0011).is_empty());
        assert!(StatusBit::ChargeAllowed.is_set(0b001));
        assert!(!StatusBit::DischargeAllowed.is_set(0b001));
    }

    #[test]
    fn firmware_version_test() {
        assert_eq!(
            FirmwareVersion::decode_from_holding_registers(&[0x0102]).unwrap(),
            FirmwareVersion(0x0102)
        );
        assert!(FirmwareVersion::decode_from_holding_registers(&[]).is_err());
    }
}
