//! Port identifiers.
//!
//! A port id packs direction and index into one `u32`: the high bit marks an
//! input, the low 31 bits are the slot index. Each pass publishes its ports
//! as constants built with [`PortId::input`] and [`PortId::output`].

use std::fmt;

const INPUT_BIT: u32 = 1 << 31;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u32);

impl PortId {
    pub const fn input(index: u32) -> Self {
        Self(INPUT_BIT | index)
    }

    pub const fn output(index: u32) -> Self {
        Self(!INPUT_BIT & index)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_input(self) -> bool {
        self.0 & INPUT_BIT != 0
    }

    pub const fn is_output(self) -> bool {
        !self.is_input()
    }

    pub const fn index(self) -> u32 {
        self.0 & !INPUT_BIT
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_input() {
            write!(f, "in{}", self.index())
        } else {
            write!(f, "out{}", self.index())
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        assert_eq!(PortId::input(3).raw(), 0x8000_0003);
        assert_eq!(PortId::output(3).raw(), 3);
        assert!(PortId::input(0).is_input());
        assert!(PortId::output(0).is_output());
        assert_eq!(PortId::input(7).index(), 7);
        assert_eq!(PortId::output(7).index(), 7);
    }

    #[test]
    fn test_output_masks_high_bit() {
        // an index that collides with the direction bit still yields an output
        let port = PortId::output(INPUT_BIT | 5);
        assert!(port.is_output());
        assert_eq!(port.index(), 5);
    }

    #[test]
    fn test_raw_round_trip_and_display() {
        let port = PortId::from_raw(PortId::input(2).raw());
        assert_eq!(port, PortId::input(2));
        assert_eq!(port.to_string(), "in2");
        assert_eq!(format!("{:?}", PortId::output(1)), "out1");
    }
}
