use std::fmt::{Display, Formatter};

/// A chip on the machine, addressed by its (x, y) coordinates
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ChipLocation {
    pub x: u8,
    pub y: u8,
}

impl ChipLocation {
    pub fn new(x: u8, y: u8) -> ChipLocation {
        ChipLocation { x, y }
    }

    /// The chip coordinates packed into a single word as the monitor firmware expects them:
    ///  x in the upper half-word, y in the lower half-word.
    pub fn packed(&self) -> u32 {
        ((self.x as u32) << 16) | self.y as u32
    }

    pub fn from_packed(word: u32) -> ChipLocation {
        ChipLocation {
            x: (word >> 16) as u8,
            y: word as u8,
        }
    }
}

impl Display for ChipLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// A single processor: the unit that owns memory regions and runs a monitor or application
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CoreLocation {
    pub x: u8,
    pub y: u8,
    pub p: u8,
}

impl CoreLocation {
    pub fn new(x: u8, y: u8, p: u8) -> CoreLocation {
        CoreLocation { x, y, p }
    }

    pub fn chip(&self) -> ChipLocation {
        ChipLocation { x: self.x, y: self.y }
    }
}

impl Display for CoreLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::origin(0, 0, 0)]
    #[case::x_only(3, 0, 0x0003_0000)]
    #[case::y_only(0, 7, 0x0000_0007)]
    #[case::both(255, 255, 0x00ff_00ff)]
    fn test_packed(#[case] x: u8, #[case] y: u8, #[case] expected: u32) {
        let chip = ChipLocation::new(x, y);
        assert_eq!(chip.packed(), expected);
        assert_eq!(ChipLocation::from_packed(expected), chip);
    }

    #[test]
    fn test_display() {
        assert_eq!(CoreLocation::new(1, 2, 3).to_string(), "(1,2,3)");
        assert_eq!(CoreLocation::new(1, 2, 3).chip().to_string(), "(1,2)");
    }
}
