pub struct Utils;

impl Utils {
    /// Big-endian u16 at `offset`.
    pub fn u16ify(array: &[u8], offset: usize) -> u16 {
        u16::from_be_bytes([array[offset], array[offset + 1]])
    }

    /// Two's-complement reinterpretation of a raw register word.
    pub fn signed(word: u16) -> i32 {
        i32::from(word as i16)
    }

    pub fn round(x: f64, decimals: u32) -> f64 {
        let y = 10i64.pow(decimals) as f64;
        (x * y).round() / y
    }

    /// Hz (or any decimal quantity) to the centi-unit integer used downstream.
    pub fn centi(x: f64) -> i32 {
        (x * 100.0).round() as i32
    }

    pub fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
