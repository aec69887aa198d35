use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Fixed Modbus device address used by the D2 BLE firmware ("K00T").
pub const DEVICE_ADDRESS: u8 = 0xD2;
/// Read holding registers.
pub const FUNCTION_READ: u8 = 0x03;

/// Request frames are always 8 bytes: address, function, start, count, CRC.
pub const REQUEST_LENGTH: usize = 8;
/// Shortest decodable response: address, function, byte count, CRC.
pub const MIN_RESPONSE_LENGTH: usize = 5;

/// Start of the preferred large-range read covering every known register.
pub const FULL_RANGE_START: u16 = 0x0000;
/// Register count of the large-range read (62 registers, 124 payload bytes).
pub const FULL_RANGE_COUNT: u16 = 0x003E;

/// Standard Modbus CRC-16: init 0xFFFF, reflected polynomial 0xA001.
///
/// The trailing two bytes of every frame carry this value little-endian
/// (low byte first). The device accepts no other variant.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Logical measurement to register address table.
///
/// Addresses are fixed by the firmware except for SOC, which moves between
/// firmware variants and is therefore configurable at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegisterMap {
    pub cell_voltage_base: u16,
    pub temperature_base: u16,
    pub total_voltage: u16,
    pub current: u16,
    pub soc: u16,
    pub mosfet_status: u16,
    pub fault_bitmap: u16,
}

impl RegisterMap {
    /// Default SOC register observed on "K00T" firmware.
    pub const DEFAULT_SOC_REGISTER: u16 = 0x002C;

    pub const fn with_soc_register(soc: u16) -> Self {
        Self {
            cell_voltage_base: 0x0000,
            temperature_base: 0x0020,
            total_voltage: 0x0028,
            current: 0x0029,
            soc,
            mosfet_status: 0x002D,
            fault_bitmap: 0x003A,
        }
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::with_soc_register(Self::DEFAULT_SOC_REGISTER)
    }
}

/// A read-holding-registers request.
///
/// Encoding is deterministic, which the session relies on to recognize
/// echoed commands in the notification stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub start_register: u16,
    pub register_count: u16,
}

impl ReadRequest {
    pub const fn new(start_register: u16, register_count: u16) -> Self {
        Self {
            start_register,
            register_count,
        }
    }

    /// The large-range read covering cells, temperatures, pack voltage,
    /// current, SOC and status registers in one round trip.
    pub const fn full_range() -> Self {
        Self::new(FULL_RANGE_START, FULL_RANGE_COUNT)
    }

    /// Serialize to the 8-byte wire form:
    /// `[addr, func, startHi, startLo, countHi, countLo, crcLo, crcHi]`.
    pub fn encode(&self) -> [u8; REQUEST_LENGTH] {
        let mut frame = [0u8; REQUEST_LENGTH];
        frame[0] = DEVICE_ADDRESS;
        frame[1] = FUNCTION_READ;
        frame[2] = (self.start_register >> 8) as u8;
        frame[3] = self.start_register as u8;
        frame[4] = (self.register_count >> 8) as u8;
        frame[5] = self.register_count as u8;
        let crc = crc16(&frame[0..6]);
        frame[6] = crc as u8;
        frame[7] = (crc >> 8) as u8;
        frame
    }

    /// The transport loops written commands back as notifications. Any
    /// buffer byte-equal to the request must be dropped before parsing.
    pub fn is_echo(&self, buffer: &[u8]) -> bool {
        buffer == self.encode()
    }
}

/// Structural failures of a response frame. None of these are fatal to the
/// session: the read cycle simply yields no reading and the next tick
/// retries naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("response too short: {len} bytes")]
    TooShort { len: usize },
    #[error("device address mismatch: expected 0x{expected:02X}, received 0x{received:02X}")]
    AddressMismatch { expected: u8, received: u8 },
    #[error("Modbus exception response, code 0x{code:02X}")]
    ExceptionResponse { code: u8 },
    #[error("function code mismatch: expected 0x{expected:02X}, received 0x{received:02X}")]
    FunctionMismatch { expected: u8, received: u8 },
    #[error("truncated payload: header announces {announced} bytes, {available} available")]
    TruncatedPayload { announced: usize, available: usize },
    #[error("CRC mismatch")]
    CrcMismatch,
}

impl FrameError {
    /// True for failures that can mean "more notification fragments are
    /// still in flight" rather than a corrupt frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            FrameError::TooShort { .. } | FrameError::TruncatedPayload { .. }
        )
    }
}

/// A structurally valid response frame.
///
/// `crc_ok` is reported rather than enforced so the caller owns the policy;
/// the session discards frames with `crc_ok == false` and the payload must
/// never be decoded in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub device_address: u8,
    pub function_code: u8,
    pub byte_count: u8,
    pub payload: Vec<u8>,
    pub crc_ok: bool,
}

impl fmt::Display for ParsedFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "frame addr=0x{:02X} func=0x{:02X} bytes={} crc_ok={}",
            self.device_address, self.function_code, self.byte_count, self.crc_ok
        )
    }
}

/// Validate a raw response buffer.
///
/// Checks run in a fixed order: length, device address, exception bit,
/// function code, payload length, CRC. The CRC result does not fail the
/// parse; see [`ParsedFrame::crc_ok`].
pub fn parse_response(response: &[u8]) -> std::result::Result<ParsedFrame, FrameError> {
    if response.len() < MIN_RESPONSE_LENGTH {
        return Err(FrameError::TooShort {
            len: response.len(),
        });
    }
    if response[0] != DEVICE_ADDRESS {
        log::warn!(
            "Device address mismatch - expected=0x{:02X} received=0x{:02X}",
            DEVICE_ADDRESS,
            response[0]
        );
        return Err(FrameError::AddressMismatch {
            expected: DEVICE_ADDRESS,
            received: response[0],
        });
    }
    if response[1] & 0x80 != 0 {
        let code = response[2];
        log::warn!(
            "Modbus exception response - function=0x{:02X} code=0x{code:02X}",
            response[1]
        );
        return Err(FrameError::ExceptionResponse { code });
    }
    if response[1] != FUNCTION_READ {
        return Err(FrameError::FunctionMismatch {
            expected: FUNCTION_READ,
            received: response[1],
        });
    }

    let byte_count = response[2];
    let announced = byte_count as usize;
    if response.len() < 3 + announced + 2 {
        return Err(FrameError::TruncatedPayload {
            announced,
            available: response.len().saturating_sub(5),
        });
    }

    let payload = response[3..3 + announced].to_vec();
    let frame_end = 3 + announced;
    let received_crc = u16::from_le_bytes([response[frame_end], response[frame_end + 1]]);
    let calculated_crc = crc16(&response[..frame_end]);
    let crc_ok = received_crc == calculated_crc;
    if !crc_ok {
        log::warn!(
            "Invalid CRC - calculated=0x{calculated_crc:04X} received=0x{received_crc:04X} buffer={response:02X?}"
        );
    }

    Ok(ParsedFrame {
        device_address: response[0],
        function_code: response[1],
        byte_count,
        payload,
        crc_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a valid response frame around the given payload.
    fn make_response(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![DEVICE_ADDRESS, FUNCTION_READ, payload.len() as u8];
        frame.extend_from_slice(payload);
        let crc = crc16(&frame);
        frame.push(crc as u8);
        frame.push((crc >> 8) as u8);
        frame
    }

    #[test]
    fn full_range_request_matches_captured_command() {
        // Captured from the device: request for 0x0000 count 0x003E.
        let expected = [0xD2, 0x03, 0x00, 0x00, 0x00, 0x3E, 0xD7, 0xB9];
        assert_eq!(ReadRequest::full_range().encode(), expected);
    }

    #[test]
    fn crc_of_captured_command_header() {
        let header = [0xD2, 0x03, 0x00, 0x00, 0x00, 0x3E];
        assert_eq!(crc16(&header), 0xB9D7);
    }

    #[test]
    fn encoding_is_deterministic() {
        let request = ReadRequest::new(0x0028, 1);
        assert_eq!(request.encode(), request.encode());
    }

    #[test]
    fn echo_is_detected() {
        let request = ReadRequest::full_range();
        assert!(request.is_echo(&request.encode()));
        assert!(!request.is_echo(&ReadRequest::new(0x0028, 1).encode()));
        assert!(!request.is_echo(&[0xD2, 0x03]));
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert_eq!(
            parse_response(&[0xD2, 0x03, 0x02, 0x00]),
            Err(FrameError::TooShort { len: 4 })
        );
    }

    #[test]
    fn parse_rejects_wrong_address() {
        let mut frame = make_response(&[0x01, 0x09]);
        frame[0] = 0x01;
        assert_eq!(
            parse_response(&frame),
            Err(FrameError::AddressMismatch {
                expected: 0xD2,
                received: 0x01
            })
        );
    }

    #[test]
    fn parse_reports_exception_response() {
        // Exception form: [addr][func|0x80][exception code][crc].
        let mut frame = vec![DEVICE_ADDRESS, FUNCTION_READ | 0x80, 0x02];
        let crc = crc16(&frame);
        frame.push(crc as u8);
        frame.push((crc >> 8) as u8);
        assert_eq!(
            parse_response(&frame),
            Err(FrameError::ExceptionResponse { code: 0x02 })
        );
    }

    #[test]
    fn parse_rejects_wrong_function() {
        let mut frame = make_response(&[0x01, 0x09]);
        frame[1] = 0x04;
        // Re-seal the CRC so only the function code is wrong.
        let end = frame.len() - 2;
        let crc = crc16(&frame[..end]);
        frame[end] = crc as u8;
        frame[end + 1] = (crc >> 8) as u8;
        assert_eq!(
            parse_response(&frame),
            Err(FrameError::FunctionMismatch {
                expected: 0x03,
                received: 0x04
            })
        );
    }

    #[test]
    fn parse_rejects_truncated_payload() {
        let frame = make_response(&[0x01, 0x09, 0x75, 0x4A]);
        // Drop the CRC trailer: the header still announces 4 payload bytes.
        assert_eq!(
            parse_response(&frame[..frame.len() - 2]),
            Err(FrameError::TruncatedPayload {
                announced: 4,
                available: 2
            })
        );
    }

    #[test]
    fn parse_flags_bad_crc_but_returns_frame() {
        let mut frame = make_response(&[0x01, 0x09]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let parsed = parse_response(&frame).unwrap();
        assert!(!parsed.crc_ok);
        assert_eq!(parsed.payload, vec![0x01, 0x09]);
    }

    #[test]
    fn valid_frame_round_trips_crc() {
        let frame = make_response(&[0x01, 0x09, 0x75, 0x4A]);
        let parsed = parse_response(&frame).unwrap();
        assert!(parsed.crc_ok);
        assert_eq!(parsed.byte_count, 4);
        // Recomputing the CRC over everything but the trailer reproduces it.
        let recomputed = crc16(&frame[..frame.len() - 2]);
        assert_eq!(
            recomputed.to_le_bytes().as_slice(),
            &frame[frame.len() - 2..]
        );
    }

    #[test]
    fn incomplete_classification() {
        assert!(FrameError::TooShort { len: 1 }.is_incomplete());
        assert!(FrameError::TruncatedPayload {
            announced: 124,
            available: 20
        }
        .is_incomplete());
        assert!(!FrameError::CrcMismatch.is_incomplete());
        assert!(!FrameError::ExceptionResponse { code: 1 }.is_incomplete());
    }
}
