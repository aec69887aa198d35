use crate::protocol::RegisterMap;
use chrono::{DateTime, Utc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The large-range payload carries at most 8 cell slots (8S packs).
pub const MAX_CELLS: usize = 8;
/// And at most 4 temperature sensor slots.
pub const MAX_TEMPERATURE_SENSORS: usize = 4;

/// Plausible sensor range; values outside are discarded, not clamped.
const TEMPERATURE_MIN_C: f32 = -40.0;
const TEMPERATURE_MAX_C: f32 = 120.0;

/// The firmware reports temperatures in 0.1 K units with a fixed 273.1
/// calibration constant (not 273.15).
const TEMPERATURE_OFFSET: f32 = 273.1;

/// Zero point of the offset-encoded current register.
const CURRENT_ZERO_OFFSET: u16 = 30000;

/// Linear voltage-to-SOC approximation for an 8S LiFePO4 pack.
/// A convenience fallback, not a calibration; see [`Reading::soc_estimated`].
const ESTIMATE_VOLTAGE_EMPTY: f32 = 24.0;
const ESTIMATE_VOLTAGE_FULL: f32 = 29.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CurrentDirection {
    Charging,
    Discharging,
    Idle,
}

/// One decoded telemetry snapshot. Immutable once built; ownership passes
/// to whichever consumer receives it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    pub total_voltage_v: f32,
    /// Negative while charging, positive while discharging.
    pub current_a: f32,
    pub current_direction: CurrentDirection,
    pub cell_voltages_v: Vec<f32>,
    pub temperatures_c: Vec<f32>,
    pub soc_percent: Option<f32>,
    /// True when `soc_percent` came from the voltage estimate rather than
    /// the SOC register.
    pub soc_estimated: bool,
    pub crc_valid: bool,
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    /// Instantaneous pack power in watts.
    pub fn power_w(&self) -> f32 {
        self.total_voltage_v * self.current_a
    }

    /// Mean of the valid temperature sensors, if any survived the filter.
    pub fn average_temperature_c(&self) -> Option<f32> {
        if self.temperatures_c.is_empty() {
            return None;
        }
        Some(self.temperatures_c.iter().sum::<f32>() / self.temperatures_c.len() as f32)
    }

    /// Fill in the voltage-based SOC estimate when the register yielded
    /// nothing plausible. Does not overwrite a register-sourced value.
    pub fn fill_soc_estimate(&mut self) {
        if self.soc_percent.is_none() {
            self.soc_percent = Some(estimate_soc_from_voltage(self.total_voltage_v));
            self.soc_estimated = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload has no data for register 0x{register:04X}")]
    ShortPayload { register: u16 },
    #[error("total voltage register is empty")]
    MissingTotalVoltage,
}

/// Big-endian word at `register` in a payload that starts at register 0.
/// Field offset is `register_address * 2` bytes from the payload start.
fn register_word(payload: &[u8], register: u16) -> Option<u16> {
    let pos = register as usize * 2;
    let bytes = payload.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Pack voltage in volts.
pub fn decode_total_voltage(raw: u16) -> f32 {
    raw as f32 * 0.1
}

/// Offset-encoded current: 30000 is zero, above is discharge, below is
/// charge. A firmware quirk, not two's complement; reproduced exactly.
pub fn decode_current(raw: u16) -> (f32, CurrentDirection) {
    if raw >= CURRENT_ZERO_OFFSET {
        let amps = (raw - CURRENT_ZERO_OFFSET) as f32 * 0.1;
        let direction = if raw == CURRENT_ZERO_OFFSET {
            CurrentDirection::Idle
        } else {
            CurrentDirection::Discharging
        };
        (amps, direction)
    } else {
        let amps = (CURRENT_ZERO_OFFSET - raw) as f32 * 0.1;
        (-amps, CurrentDirection::Charging)
    }
}

/// Cell voltage in volts; a zero word means "no cell populated".
pub fn decode_cell_voltage(raw: u16) -> Option<f32> {
    if raw == 0 {
        return None;
    }
    Some(raw as f32 * 0.001)
}

/// Temperature in degrees Celsius, or `None` for implausible sensor values.
pub fn decode_temperature(raw: u16) -> Option<f32> {
    let celsius = (raw as f32 / 10.0) - TEMPERATURE_OFFSET;
    if !(TEMPERATURE_MIN_C..=TEMPERATURE_MAX_C).contains(&celsius) {
        log::debug!("Dropping implausible temperature raw={raw} celsius={celsius:.1}");
        return None;
    }
    Some(celsius)
}

/// SOC in percent; values outside 0..=100 are treated as not-a-reading.
pub fn decode_soc(raw: u16) -> Option<f32> {
    let percent = raw as f32 * 0.1;
    if !(0.0..=100.0).contains(&percent) {
        return None;
    }
    Some(percent)
}

/// Linear 8S LiFePO4 estimate: 24.0 V is empty, 29.2 V is full.
pub fn estimate_soc_from_voltage(voltage: f32) -> f32 {
    if voltage <= ESTIMATE_VOLTAGE_EMPTY {
        0.0
    } else if voltage >= ESTIMATE_VOLTAGE_FULL {
        100.0
    } else {
        (voltage - ESTIMATE_VOLTAGE_EMPTY) / (ESTIMATE_VOLTAGE_FULL - ESTIMATE_VOLTAGE_EMPTY)
            * 100.0
    }
}

/// Decode a large-range payload (registers 0x0000..0x003E) into a
/// [`Reading`] using the offsets implied by the register map.
///
/// Out-of-range fields are dropped individually; a partial reading is
/// valid. Only an empty total-voltage word fails the decode, since a
/// snapshot without pack voltage is not a reading.
pub fn decode_full_range(
    payload: &[u8],
    registers: &RegisterMap,
    crc_valid: bool,
) -> std::result::Result<Reading, DecodeError> {
    let raw_voltage = register_word(payload, registers.total_voltage).ok_or(
        DecodeError::ShortPayload {
            register: registers.total_voltage,
        },
    )?;
    if raw_voltage == 0 {
        return Err(DecodeError::MissingTotalVoltage);
    }
    let total_voltage_v = decode_total_voltage(raw_voltage);

    let raw_current = register_word(payload, registers.current).ok_or(
        DecodeError::ShortPayload {
            register: registers.current,
        },
    )?;
    let (current_a, current_direction) = decode_current(raw_current);

    let mut cell_voltages_v = Vec::with_capacity(MAX_CELLS);
    for slot in 0..MAX_CELLS as u16 {
        if let Some(raw) = register_word(payload, registers.cell_voltage_base + slot) {
            if let Some(volts) = decode_cell_voltage(raw) {
                cell_voltages_v.push(volts);
            }
        }
    }

    let mut temperatures_c = Vec::with_capacity(MAX_TEMPERATURE_SENSORS);
    for sensor in 0..MAX_TEMPERATURE_SENSORS as u16 {
        if let Some(raw) = register_word(payload, registers.temperature_base + sensor) {
            if let Some(celsius) = decode_temperature(raw) {
                temperatures_c.push(celsius);
            }
        }
    }

    let soc_percent = register_word(payload, registers.soc).and_then(decode_soc);

    log::debug!(
        "Decoded snapshot: {total_voltage_v:.1}V {current_a:.1}A cells={} temps={} soc={soc_percent:?}",
        cell_voltages_v.len(),
        temperatures_c.len()
    );

    Ok(Reading {
        total_voltage_v,
        current_a,
        current_direction,
        cell_voltages_v,
        temperatures_c,
        soc_percent,
        soc_estimated: false,
        crc_valid,
        captured_at: Utc::now(),
    })
}

/// First big-endian word of a single-register payload.
pub fn first_word(payload: &[u8]) -> Option<u16> {
    let bytes = payload.get(0..2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decode a payload of consecutive cell-voltage registers (fallback path,
/// payload starts at the cell base register).
pub fn decode_cell_voltages_payload(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(2)
        .take(MAX_CELLS)
        .filter_map(|pair| decode_cell_voltage(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}

/// Decode a payload of consecutive temperature registers (fallback path).
pub fn decode_temperatures_payload(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(2)
        .take(MAX_TEMPERATURE_SENSORS)
        .filter_map(|pair| decode_temperature(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}
