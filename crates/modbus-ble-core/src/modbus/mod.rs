//! MODBUS request framing and response validation for the three function codes this
//! client speaks: Read Holding Registers (0x03), Write Single Register (0x06), and
//! Write Multiple Registers (0x10).

use crate::crc;
use crate::error::{Error, Result};

/// The fixed MODBUS slave address this protocol always addresses.
pub const SLAVE_ADDRESS: u8 = 0x01;

pub const FUNC_READ_HOLDING: u8 = 0x03;
pub const FUNC_WRITE_SINGLE: u8 = 0x06;
pub const FUNC_WRITE_MULTIPLE: u8 = 0x10;

const EXCEPTION_BIT: u8 = 0x80;

/// Builds a Read Holding Registers (0x03) request frame.
pub fn build_read_holding(start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(SLAVE_ADDRESS);
    frame.push(FUNC_READ_HOLDING);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    crc::append_crc(&mut frame);
    frame
}

/// Builds a Write Single Register (0x06) request frame.
pub fn build_write_single(addr: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(SLAVE_ADDRESS);
    frame.push(FUNC_WRITE_SINGLE);
    frame.extend_from_slice(&addr.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    crc::append_crc(&mut frame);
    frame
}

/// Builds a Write Multiple Registers (0x10) request frame. `data` must hold an even
/// number of bytes; callers are expected to have validated this already (see
/// `Client::write_registers`), which is where `InvalidArgument` is raised.
pub fn build_write_multiple(start: u16, data: &[u8]) -> Vec<u8> {
    let qty = (data.len() / 2) as u16;
    let mut frame = Vec::with_capacity(7 + data.len());
    frame.push(SLAVE_ADDRESS);
    frame.push(FUNC_WRITE_MULTIPLE);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&qty.to_be_bytes());
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    crc::append_crc(&mut frame);
    frame
}

/// The expected response size in bytes for a Read Holding Registers response
/// carrying `qty` registers: `addr(1) + func(1) + byte_count(1) + 2*qty + crc(2)`.
pub fn expected_read_response_size(qty: u16) -> usize {
    2 * qty as usize + 5
}

/// Validates and unwraps a response frame against the request that produced it.
///
/// Validation order, per spec: (1) length, (2) CRC, (3) exception bit, (4) function
/// code match, (5) size consistency. Returns the payload slice appropriate to the
/// function code: for 0x03, the register bytes (`frame[3..-2]`); for 0x06, the two
/// value bytes; for 0x10, the echoed `[addr][qty]`.
pub fn parse_response(request_function: u8, frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 3 {
        return Err(Error::Checksum("response shorter than 3 bytes".into()));
    }

    let body = &frame[..frame.len() - 2];
    let received_crc = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
    if crc::crc16(body) != received_crc {
        return Err(Error::Checksum("CRC mismatch".into()));
    }

    let function = frame[1];
    if function & EXCEPTION_BIT != 0 {
        if frame.len() < 3 {
            return Err(Error::Checksum("exception response truncated".into()));
        }
        return Err(Error::ModbusException { code: frame[2] });
    }

    if function != request_function {
        return Err(Error::Checksum(format!(
            "unexpected function code: expected {request_function:#04x}, got {function:#04x}"
        )));
    }

    match function {
        FUNC_READ_HOLDING => {
            if frame.len() < 3 {
                return Err(Error::Checksum("read response too short".into()));
            }
            let byte_count = frame[2] as usize;
            if frame.len() != 3 + byte_count + 2 {
                return Err(Error::Checksum("read response size mismatch".into()));
            }
            Ok(frame[3..frame.len() - 2].to_vec())
        }
        FUNC_WRITE_SINGLE => {
            if frame.len() != 8 {
                return Err(Error::Checksum("write-single response size mismatch".into()));
            }
            Ok(frame[4..6].to_vec())
        }
        FUNC_WRITE_MULTIPLE => {
            if frame.len() != 8 {
                return Err(Error::Checksum(
                    "write-multiple response size mismatch".into(),
                ));
            }
            Ok(frame[2..6].to_vec())
        }
        other => Err(Error::Checksum(format!(
            "unsupported function code: {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_request_matches_known_vector() {
        let frame = build_read_holding(0, 10);
        assert_eq!(hex::encode(&frame), "01030000000ac5cd");
    }

    #[test]
    fn read_holding_response_round_trip() {
        let request = build_read_holding(10, 3);
        assert_eq!(&request[..2], &[SLAVE_ADDRESS, FUNC_READ_HOLDING]);

        // slave(1) func(1) bytecount(1)=6 data(6) crc(2)
        let mut response = vec![0x01, 0x03, 0x06, 0x00, 0x64, 0x00, 0xC8, 0x01, 0x2C];
        crc::append_crc(&mut response);
        let payload = parse_response(FUNC_READ_HOLDING, &response).unwrap();
        assert_eq!(payload, vec![0x00, 0x64, 0x00, 0xC8, 0x01, 0x2C]);
    }

    #[test]
    fn write_single_echoes_value() {
        let mut response = vec![0x01, 0x06, 0x00, 0x32, 0xAB, 0xCD];
        crc::append_crc(&mut response);
        let payload = parse_response(FUNC_WRITE_SINGLE, &response).unwrap();
        assert_eq!(payload, vec![0xAB, 0xCD]);
    }

    #[test]
    fn write_multiple_echoes_addr_and_qty() {
        let mut response = vec![0x01, 0x10, 0x00, 0x32, 0x00, 0x02];
        crc::append_crc(&mut response);
        let payload = parse_response(FUNC_WRITE_MULTIPLE, &response).unwrap();
        assert_eq!(payload, vec![0x00, 0x32, 0x00, 0x02]);
    }

    #[test]
    fn crc_mismatch_is_checksum_error() {
        let mut response = vec![0x01, 0x06, 0x00, 0x32, 0xAB, 0xCD];
        crc::append_crc(&mut response);
        let last = response.len() - 1;
        response[last] ^= 0xFF;
        assert!(matches!(
            parse_response(FUNC_WRITE_SINGLE, &response),
            Err(Error::Checksum(_))
        ));
    }

    #[test]
    fn truncated_response_is_checksum_error() {
        let response = vec![0x01, 0x06];
        assert!(matches!(
            parse_response(FUNC_WRITE_SINGLE, &response),
            Err(Error::Checksum(_))
        ));
    }

    #[test]
    fn exception_bit_decodes_code() {
        let mut response = vec![0x01, FUNC_READ_HOLDING | 0x80, 0x02];
        crc::append_crc(&mut response);
        let err = parse_response(FUNC_READ_HOLDING, &response).unwrap_err();
        assert!(matches!(err, Error::ModbusException { code: 2 }));
    }

    #[test]
    fn wrong_function_code_is_rejected() {
        let mut response = vec![0x01, FUNC_WRITE_SINGLE, 0x00, 0x32, 0xAB, 0xCD];
        crc::append_crc(&mut response);
        assert!(matches!(
            parse_response(FUNC_READ_HOLDING, &response),
            Err(Error::Checksum(_))
        ));
    }
}
