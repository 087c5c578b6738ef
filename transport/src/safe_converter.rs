//! Conversions between the u32 words of the wire format and in-memory lengths and indices

/// Widening conversion that cannot lose information on the supported targets
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing conversion of lengths and sequence numbers whose range the protocol logic has
///  already established, e.g. indices below a session's `max_sequence`.
/// NB: panics otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        u32::try_from(self).expect("this is a bug: a length or sequence number outside the u32 range got past the range checks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let index: usize = 4711u32.safe_cast();
        assert_eq!(index, 4711);
        let word: u32 = index.prechecked_cast();
        assert_eq!(word, 4711);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u32 = (u32::MAX as usize + 1).prechecked_cast();
    }
}
