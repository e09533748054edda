//! The two checksums spoken by the dongle.
//!
//! Register commands carry a Modbus RTU CRC (low byte first). PI-17 text
//! commands carry CRC-16/XMODEM (high byte first) where neither byte may be a
//! framing character, so colliding bytes are bumped by one.

const RESERVED: [u8; 3] = [b'(', b'\r', b'\n'];

pub fn crc16_modbus(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

pub fn crc16_xmodem(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Bump a checksum byte off `(`, CR and LF. 0xFF is not reserved and passes
/// through unchanged.
pub fn adjust_crc_byte(byte: u8) -> u8 {
    if RESERVED.contains(&byte) {
        byte + 1
    } else {
        byte
    }
}

/// Modbus checksum in wire order.
pub fn modbus_trailer(data: &[u8]) -> [u8; 2] {
    crc16_modbus(data).to_le_bytes()
}

/// XMODEM checksum in wire order with both bytes escaped.
pub fn xmodem_trailer(data: &[u8]) -> [u8; 2] {
    let [hi, lo] = crc16_xmodem(data).to_be_bytes();
    [adjust_crc_byte(hi), adjust_crc_byte(lo)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_strings() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn captured_pi17_commands() {
        // QPIGS\xB7\xA9\r and QMOD\x49\xC1\r as sent by the vendor app
        assert_eq!(crc16_xmodem(b"QPIGS"), 0xB7A9);
        assert_eq!(xmodem_trailer(b"QPIGS"), [0xB7, 0xA9]);
        assert_eq!(crc16_xmodem(b"QMOD"), 0x49C1);
        assert_eq!(xmodem_trailer(b"QMOD"), [0x49, 0xC1]);
    }

    #[test]
    fn captured_register_read() {
        let request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16_modbus(&request), 0x0A84);
        assert_eq!(modbus_trailer(&request), [0x84, 0x0A]);
    }

    #[test]
    fn adjust_never_yields_reserved() {
        for b in 0..=u8::MAX {
            assert!(!RESERVED.contains(&adjust_crc_byte(b)), "byte {:#04x}", b);
        }
        assert_eq!(adjust_crc_byte(0x28), 0x29);
        assert_eq!(adjust_crc_byte(0x0D), 0x0E);
        assert_eq!(adjust_crc_byte(0x0A), 0x0B);
        assert_eq!(adjust_crc_byte(0xFF), 0xFF);
        assert_eq!(adjust_crc_byte(0x41), 0x41);
    }
}
