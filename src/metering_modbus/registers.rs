/* Fixed register map of the supported meter family (DDS238 style single phase meters) */

/// Block with the instantaneous values
pub const INSTANT_BLOCK_START: u16 = 0x000C;
pub const INSTANT_BLOCK_LEN: u16 = 10;

const VOLTAGE_OFFSET: usize = 0;
const CURRENT_OFFSET: usize = 1;
const POWER_OFFSET: usize = 3;

/// 32 bit cumulative energy counter, high word first
pub const ENERGY_START: u16 = 0x0000;
pub const ENERGY_LEN: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instantaneous {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Caller guarantees `regs` holds at least [`INSTANT_BLOCK_LEN`] words
pub fn decode_instantaneous(regs: &[u16]) -> Instantaneous {
    return Instantaneous {
        voltage: regs[VOLTAGE_OFFSET] as f64 / 10.0,
        current: regs[CURRENT_OFFSET] as f64 / 100.0,
        power: regs[POWER_OFFSET] as f64,
    };
}

pub fn combine_words(high: u16, low: u16) -> u32 {
    u32::from(high) << 16 | u32::from(low)
}

/// Caller guarantees `regs` holds at least [`ENERGY_LEN`] words
pub fn decode_energy(regs: &[u16]) -> f64 {
    combine_words(regs[0], regs[1]) as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_instantaneous() {
        let regs = [2205, 123, 0, 271, 0, 0, 0, 0, 0, 0];
        let v = decode_instantaneous(&regs);
        assert_eq!(v.voltage, 220.5);
        assert_eq!(v.current, 1.23);
        assert_eq!(v.power, 271.0);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let regs = [2301, 4567, 9, 1050, 1, 2, 3, 4, 5, 6];
        let first = decode_instantaneous(&regs);
        let second = decode_instantaneous(&regs);
        assert_eq!(first.voltage.to_bits(), second.voltage.to_bits());
        assert_eq!(first.current.to_bits(), second.current.to_bits());
        assert_eq!(first.power.to_bits(), second.power.to_bits());
        assert_eq!(decode_energy(&[3, 0xBEEF]).to_bits(), decode_energy(&[3, 0xBEEF]).to_bits());
    }

    #[test]
    fn test_combine_words() {
        assert_eq!(combine_words(0x0001, 0x0000), 65536);
        assert_eq!(combine_words(0x0000, 0xFFFF), 65535);
        assert_eq!(combine_words(0xFFFF, 0xFFFF), u32::MAX);
    }

    #[test]
    fn test_decode_energy_boundaries() {
        assert_eq!(decode_energy(&[0x0001, 0x0000]), 655.36);
        assert_eq!(decode_energy(&[0x0000, 0xFFFF]), 655.35);
        /* 123456 does not fit the low word, it is split over both */
        assert_eq!(decode_energy(&[0x0001, 0xE240]), 1234.56);
    }
}
