//! Blood Pressure Profile protocol
//!
//! This module contains the GATT identifiers of the cuff, the IEEE-11073
//! SFLOAT codec and the decoder for Blood Pressure Measurement
//! notifications.

use crate::domain::classifier::classify;
use crate::domain::models::Reading;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::trace;
use uuid::Uuid;

/// Blood Pressure service (0x1810)
pub const BLOOD_PRESSURE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x00001810_0000_1000_8000_00805f9b34fb);

/// Blood Pressure Measurement characteristic (0x2A35), indicate/notify
pub const BLOOD_PRESSURE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a35_0000_1000_8000_00805f9b34fb);

/// Vendor control characteristic accepting the START / CANCEL payloads
pub const VENDOR_CONTROL_UUID: Uuid = Uuid::from_u128(0x583cb5b3_875d_40ed_9098_c39eb0c1983d);

/// Flags byte, bit 1: a 7 byte timestamp follows the pressures
pub const FLAG_TIMESTAMP_PRESENT: u8 = 0x02;
/// Flags byte, bit 2: a pulse-rate SFLOAT follows
pub const FLAG_PULSE_RATE_PRESENT: u8 = 0x04;

/// Cuff pressures outside (0, MAX) are not inflation progress
pub const MAX_CUFF_PRESSURE: f64 = 300.0;

const TIMESTAMP_LEN: usize = 7;

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}

/// IEEE-11073 16-bit SFLOAT: 12-bit signed mantissa, 4-bit signed exponent.
///
/// ```text
///  15      12 11                     0
/// +----------+------------------------+
/// | exponent |        mantissa        |
/// +----------+------------------------+
/// value = mantissa * 10^exponent
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sfloat {
    mantissa: i16,
    exponent: i8,
}

impl Sfloat {
    pub const NAN: u16 = 0x07FF;
    pub const NRES: u16 = 0x0800;
    pub const POSITIVE_INFINITY: u16 = 0x07FE;
    pub const NEGATIVE_INFINITY: u16 = 0x0802;

    /// Build from parts; `None` if either part is out of range
    pub fn new(mantissa: i16, exponent: i8) -> Option<Self> {
        if !(-2048..=2047).contains(&mantissa) || !(-8..=7).contains(&exponent) {
            return None;
        }
        Some(Self { mantissa, exponent })
    }

    pub fn from_raw(raw: u16) -> Self {
        let mantissa = (raw & 0x0FFF) as i16;
        let exponent = ((raw >> 12) & 0x0F) as i8;
        Self {
            mantissa: if mantissa >= 0x0800 {
                mantissa - 0x1000
            } else {
                mantissa
            },
            exponent: if exponent >= 8 { exponent - 16 } else { exponent },
        }
    }

    pub fn to_raw(self) -> u16 {
        let mantissa = (self.mantissa as u16) & 0x0FFF;
        let exponent = (self.exponent as u16) & 0x0F;
        (exponent << 12) | mantissa
    }

    pub fn mantissa(&self) -> i16 {
        self.mantissa
    }

    pub fn exponent(&self) -> i8 {
        self.exponent
    }

    pub fn value(&self) -> f64 {
        match self.to_raw() {
            Self::NAN | Self::NRES => f64::NAN,
            Self::POSITIVE_INFINITY => f64::INFINITY,
            Self::NEGATIVE_INFINITY => f64::NEG_INFINITY,
            _ => f64::from(self.mantissa) * 10f64.powi(i32::from(self.exponent)),
        }
    }
}

/// A completed measurement, values already rounded to whole units
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementFrame {
    pub flags: u8,
    pub systolic: u16,
    pub diastolic: u16,
    pub mean_arterial_pressure: u16,
    /// 0 when the cuff did not send a pulse rate
    pub heart_rate: u16,
    /// Cuff clock, if the timestamp block was present and valid
    pub device_time: Option<NaiveDateTime>,
}

impl MeasurementFrame {
    pub fn into_reading(self, timestamp: DateTime<Utc>) -> Reading {
        Reading {
            systolic: self.systolic,
            diastolic: self.diastolic,
            mean_arterial_pressure: self.mean_arterial_pressure,
            heart_rate: self.heart_rate,
            timestamp,
            status: classify(self.systolic, self.diastolic),
            synced: false,
        }
    }
}

/// One decoded notification
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    /// Diastolic > 0: the measurement is done
    Terminal(MeasurementFrame),
    /// Diastolic = 0: live cuff pressure while inflating/deflating
    Intermediate { cuff_pressure: u16 },
}

/// Little-endian cursor over a notification payload
struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let slice = self.bytes.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn sfloat(&mut self) -> Option<f64> {
        self.u16().map(|raw| Sfloat::from_raw(raw).value())
    }

    /// Consumes exactly 7 bytes; the inner `None` means "present but not a real date"
    fn device_time(&mut self) -> Option<Option<NaiveDateTime>> {
        let b = self.take(TIMESTAMP_LEN)?;
        let year = u16::from_le_bytes([b[0], b[1]]);
        let time = NaiveDate::from_ymd_opt(i32::from(year), u32::from(b[2]), u32::from(b[3]))
            .and_then(|date| {
                date.and_hms_opt(u32::from(b[4]), u32::from(b[5]), u32::from(b[6]))
            });
        Some(time)
    }
}

/// Decode a Blood Pressure Measurement notification.
///
/// # Payload
///
/// ```text
/// [0]     : Flags
///           bit 1: timestamp present
///           bit 2: pulse rate present
/// [1-2]   : Systolic (SFLOAT)
/// [3-4]   : Diastolic (SFLOAT)
/// [5-6]   : Mean arterial pressure (SFLOAT)
/// [+7]    : Timestamp, if flagged (year u16, month, day, hour, minute, second)
/// [+2]    : Pulse rate (SFLOAT), if flagged
/// ```
///
/// Returns `None` for anything malformed or implausible. Never panics.
pub fn decode(bytes: &[u8]) -> Option<RawFrame> {
    trace!("Raw measurement packet: {:02X?}", bytes);

    let mut reader = FrameReader::new(bytes);
    let flags = reader.u8()?;
    let systolic = reader.sfloat()?;
    let diastolic = reader.sfloat()?;
    let mean_arterial_pressure = reader.sfloat()?;

    let device_time = if flags & FLAG_TIMESTAMP_PRESENT != 0 {
        reader.device_time()?
    } else {
        None
    };

    let heart_rate = if flags & FLAG_PULSE_RATE_PRESENT != 0 {
        reader.sfloat()?
    } else {
        0.0
    };

    if diastolic == 0.0 {
        return intermediate(systolic);
    }

    if !systolic.is_finite() || !diastolic.is_finite() {
        return None;
    }
    if systolic <= 0.0 || diastolic <= 0.0 || systolic < diastolic {
        return None;
    }

    let systolic = round_to_u16(systolic)?;
    let diastolic = round_to_u16(diastolic)?;
    if diastolic == 0 {
        return None;
    }

    let mean_arterial_pressure = round_to_u16(mean_arterial_pressure)
        .filter(|map| *map > 0)
        .unwrap_or_else(|| estimate_map(systolic, diastolic));

    Some(RawFrame::Terminal(MeasurementFrame {
        flags,
        systolic,
        diastolic,
        mean_arterial_pressure,
        heart_rate: round_to_u16(heart_rate).unwrap_or(0),
        device_time,
    }))
}

fn intermediate(cuff_pressure: f64) -> Option<RawFrame> {
    if !(cuff_pressure > 0.0 && cuff_pressure < MAX_CUFF_PRESSURE) {
        return None;
    }
    Some(RawFrame::Intermediate {
        cuff_pressure: round_to_u16(cuff_pressure)?,
    })
}

fn round_to_u16(value: f64) -> Option<u16> {
    let rounded = value.round();
    if rounded.is_finite() && (0.0..=f64::from(u16::MAX)).contains(&rounded) {
        Some(rounded as u16)
    } else {
        None
    }
}

/// MAP approximation used when the cuff does not report one
fn estimate_map(systolic: u16, diastolic: u16) -> u16 {
    let sum = u32::from(systolic) + 2 * u32::from(diastolic);
    ((f64::from(sum) / 3.0).round()) as u16
}

/// Commands written to the vendor control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuffCommand {
    Start,
    Cancel,
}

/// Vendor payloads for each [`CuffCommand`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    pub start: Vec<u8>,
    pub cancel: Vec<u8>,
}

impl CommandSet {
    pub fn encode(&self, command: CuffCommand) -> Vec<u8> {
        match command {
            CuffCommand::Start => self.start.clone(),
            CuffCommand::Cancel => self.cancel.clone(),
        }
    }
}
