//! MODBUS CRC-16: polynomial 0xA001, initial value 0xFFFF, byte-by-byte,
//! bit-reflected, no final XOR.

/// Computes the MODBUS CRC-16 over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
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

/// Appends the little-endian CRC-16 of `frame` to itself.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // 01 03 00 00 00 0A -> CRC 0xCDC5, little-endian C5 CD.
        let frame = hex::decode("01030000000a").unwrap();
        let crc = crc16(&frame);
        assert_eq!(crc.to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn round_trip_over_many_frames() {
        for len in 0..64usize {
            let frame: Vec<u8> = (0..len as u8).collect();
            let mut framed = frame.clone();
            append_crc(&mut framed);
            let body = &framed[..framed.len() - 2];
            let crc = crc16(body);
            assert_eq!(framed[framed.len() - 2], (crc & 0xFF) as u8);
            assert_eq!(framed[framed.len() - 1], (crc >> 8) as u8);
        }
    }

    #[test]
    fn empty_input_is_init_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }
}
