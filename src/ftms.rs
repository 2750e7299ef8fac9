//! FTMS (Fitness Machine Service) wire protocol.
//!
//! Indoor Bike Data (0x2AD2) notification decoding and Fitness Machine
//! Control Point (0x2AD9) command building / response parsing, per FTMS v1.0.

use crate::types::TelemetrySample;
use std::time::Instant;
use uuid::Uuid;

/// FTMS Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data Characteristic UUID (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point UUID (0x2AD9)
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// FTMS Control Point opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtmsOpcode {
    /// Request control of the fitness machine
    RequestControl = 0x00,
    /// Set target speed
    SetTargetSpeed = 0x02,
    /// Set target resistance level
    SetTargetResistanceLevel = 0x04,
    /// Set target power
    SetTargetPower = 0x05,
    /// Set target heart rate
    SetTargetHeartRate = 0x06,
    /// Stop or pause training
    StopOrPause = 0x08,
    /// Set indoor bike simulation parameters
    SetIndoorBikeSimulation = 0x11,
    /// Response code marker (first byte of every response indication)
    ResponseCode = 0x80,
}

/// Result code carried in a control point response indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Procedure completed successfully
    Success,
    /// Opcode not supported by this machine
    OpNotSupported,
    /// Parameter outside the machine's supported range
    InvalidParameter,
    /// Procedure failed
    OperationFailed,
    /// The machine does not permit control by this client
    ControlNotPermitted,
}

impl ResultCode {
    /// Parse a result code byte. Unknown values map to `OperationFailed`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => ResultCode::Success,
            0x02 => ResultCode::OpNotSupported,
            0x03 => ResultCode::InvalidParameter,
            0x05 => ResultCode::ControlNotPermitted,
            _ => ResultCode::OperationFailed,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Success => write!(f, "Success"),
            ResultCode::OpNotSupported => write!(f, "Op Code Not Supported"),
            ResultCode::InvalidParameter => write!(f, "Invalid Parameter"),
            ResultCode::OperationFailed => write!(f, "Operation Failed"),
            ResultCode::ControlNotPermitted => write!(f, "Control Not Permitted"),
        }
    }
}

/// A parsed control point response indication.
#[derive(Debug, Clone, Copy)]
pub struct ControlResponse {
    /// Opcode of the request this response answers
    pub request_opcode: u8,
    /// Outcome of the procedure
    pub result: ResultCode,
}

/// Parse a control point response indication `[0x80, opcode, result]`.
pub fn parse_control_response(data: &[u8]) -> Option<ControlResponse> {
    if data.len() < 3 || data[0] != FtmsOpcode::ResponseCode as u8 {
        return None;
    }

    Some(ControlResponse {
        request_opcode: data[1],
        result: ResultCode::from_byte(data[2]),
    })
}

/// Indoor Bike Data flags (first 2 bytes).
#[derive(Debug, Clone, Copy)]
struct IndoorBikeDataFlags {
    /// More data available (bit 0). Inverted on the wire: when this bit is
    /// CLEAR, instantaneous speed is present.
    more_data: bool,
    /// Average speed present (bit 1)
    avg_speed_present: bool,
    /// Instantaneous cadence present (bit 2)
    inst_cadence_present: bool,
    /// Average cadence present (bit 3)
    avg_cadence_present: bool,
    /// Total distance present (bit 4)
    total_distance_present: bool,
    /// Resistance level present (bit 5)
    resistance_level_present: bool,
    /// Instantaneous power present (bit 6)
    inst_power_present: bool,
    /// Average power present (bit 7)
    avg_power_present: bool,
    /// Expended energy present (bit 8)
    expended_energy_present: bool,
    /// Heart rate present (bit 9)
    heart_rate_present: bool,
    /// Metabolic equivalent present (bit 10)
    metabolic_equivalent_present: bool,
    /// Elapsed time present (bit 11)
    elapsed_time_present: bool,
    /// Remaining time present (bit 12)
    remaining_time_present: bool,
}

impl IndoorBikeDataFlags {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let flags = u16::from_le_bytes([data[0], data[1]]);

        Some(Self {
            more_data: (flags & 0x0001) != 0,
            avg_speed_present: (flags & 0x0002) != 0,
            inst_cadence_present: (flags & 0x0004) != 0,
            avg_cadence_present: (flags & 0x0008) != 0,
            total_distance_present: (flags & 0x0010) != 0,
            resistance_level_present: (flags & 0x0020) != 0,
            inst_power_present: (flags & 0x0040) != 0,
            avg_power_present: (flags & 0x0080) != 0,
            expended_energy_present: (flags & 0x0100) != 0,
            heart_rate_present: (flags & 0x0200) != 0,
            metabolic_equivalent_present: (flags & 0x0400) != 0,
            elapsed_time_present: (flags & 0x0800) != 0,
            remaining_time_present: (flags & 0x1000) != 0,
        })
    }
}

/// Cursor over the field bytes following the flag field.
///
/// Every accessor returns `None` once the buffer runs out, which lets the
/// decoder stop the field walk on a truncated notification while keeping
/// the fields parsed so far.
struct FieldCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 2 }
    }

    fn read_u16(&mut self) -> Option<u16> {
        if self.offset + 2 > self.data.len() {
            return None;
        }
        let value = u16::from_le_bytes([self.data[self.offset], self.data[self.offset + 1]]);
        self.offset += 2;
        Some(value)
    }

    fn read_i16(&mut self) -> Option<i16> {
        self.read_u16().map(|v| v as i16)
    }

    fn skip(&mut self, width: usize) -> Option<()> {
        if self.offset + width > self.data.len() {
            return None;
        }
        self.offset += width;
        Some(())
    }
}

/// Decode an Indoor Bike Data notification into a telemetry sample.
///
/// The field walk follows the documented FTMS field order and consumes the
/// documented width for every present field, including fields this engine
/// does not use, so that later offsets stay correct. A buffer shorter than
/// the flags claim stops the walk; whatever was already parsed is returned
/// rather than failing the whole sample.
///
/// Returns `None` when the flag field itself is missing or no field of
/// interest was present.
pub fn decode_indoor_bike_data(data: &[u8]) -> Option<TelemetrySample> {
    let flags = IndoorBikeDataFlags::from_bytes(data)?;
    let mut cursor = FieldCursor::new(data);

    let mut sample = TelemetrySample {
        timestamp: Instant::now(),
        power_watts: None,
        cadence_rpm: None,
        speed_kmh: None,
    };

    // The walk body returns None on the first truncated field.
    let complete = (|| {
        // Instantaneous speed, 0.01 km/h (present when More Data is CLEAR)
        if !flags.more_data {
            sample.speed_kmh = Some(f32::from(cursor.read_u16()?) / 100.0);
        }
        if flags.avg_speed_present {
            cursor.skip(2)?;
        }
        // Instantaneous cadence, 0.5 RPM, rounded to whole RPM
        if flags.inst_cadence_present {
            let raw = cursor.read_u16()?;
            sample.cadence_rpm = Some(((u32::from(raw) + 1) / 2) as u16);
        }
        if flags.avg_cadence_present {
            cursor.skip(2)?;
        }
        // Total distance is a 24-bit field
        if flags.total_distance_present {
            cursor.skip(3)?;
        }
        if flags.resistance_level_present {
            cursor.skip(2)?;
        }
        // Instantaneous power, signed watts
        if flags.inst_power_present {
            sample.power_watts = Some(cursor.read_i16()?);
        }
        if flags.avg_power_present {
            cursor.skip(2)?;
        }
        // Expended energy: total (2), per hour (2), per minute (1)
        if flags.expended_energy_present {
            cursor.skip(5)?;
        }
        if flags.heart_rate_present {
            cursor.skip(1)?;
        }
        if flags.metabolic_equivalent_present {
            cursor.skip(1)?;
        }
        if flags.elapsed_time_present {
            cursor.skip(2)?;
        }
        if flags.remaining_time_present {
            cursor.skip(2)?;
        }
        Some(())
    })();

    if complete.is_none() {
        tracing::debug!(
            len = data.len(),
            "truncated Indoor Bike Data notification, emitting partial sample"
        );
    }

    if sample.is_empty() {
        return None;
    }

    Some(sample)
}

/// Build a control point command to request control.
pub fn build_request_control() -> Vec<u8> {
    vec![FtmsOpcode::RequestControl as u8]
}

/// Build a control point command to set target power (ERG mode).
pub fn build_set_target_power(target_watts: i16) -> Vec<u8> {
    let mut cmd = vec![FtmsOpcode::SetTargetPower as u8];
    cmd.extend_from_slice(&target_watts.to_le_bytes());
    cmd
}

/// Build a control point command to set target resistance level.
pub fn build_set_target_resistance(level: u8) -> Vec<u8> {
    vec![FtmsOpcode::SetTargetResistanceLevel as u8, level]
}

/// Build a control point command to set target speed.
///
/// `kmh` is scaled to the wire resolution of 0.01 km/h and clamped to the
/// uint16 range.
pub fn build_set_target_speed(kmh: f32) -> Vec<u8> {
    let raw = (kmh * 100.0).round().clamp(0.0, f32::from(u16::MAX)) as u16;
    let mut cmd = vec![FtmsOpcode::SetTargetSpeed as u8];
    cmd.extend_from_slice(&raw.to_le_bytes());
    cmd
}

/// Build a control point command to set target heart rate.
pub fn build_set_target_heart_rate(bpm: u8) -> Vec<u8> {
    vec![FtmsOpcode::SetTargetHeartRate as u8, bpm]
}

/// Build a control point command to stop or pause training.
///
/// `pause` - true to pause, false to stop
pub fn build_stop_training(pause: bool) -> Vec<u8> {
    vec![
        FtmsOpcode::StopOrPause as u8,
        if pause { 0x00 } else { 0x01 },
    ]
}

/// Build a control point command to set simulation parameters.
///
/// Each parameter is scaled to its wire resolution (wind speed ×0.001 m/s,
/// grade ×0.01 %, crr ×0.0001, cw ×0.01) and clamped to its wire width.
pub fn build_set_simulation(wind_speed_mps: f32, grade_percent: f32, crr: f32, cw: f32) -> Vec<u8> {
    let wind_raw = (wind_speed_mps * 1000.0)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    let grade_raw = (grade_percent * 100.0)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    let crr_raw = (crr * 10_000.0).round().clamp(0.0, 255.0) as u8;
    let cw_raw = (cw * 100.0).round().clamp(0.0, 255.0) as u8;

    let mut cmd = vec![FtmsOpcode::SetIndoorBikeSimulation as u8];
    cmd.extend_from_slice(&wind_raw.to_le_bytes());
    cmd.extend_from_slice(&grade_raw.to_le_bytes());
    cmd.push(crr_raw);
    cmd.push(cw_raw);
    cmd
}
