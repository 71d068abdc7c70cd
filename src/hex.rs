use core::fmt;

/// Lazily hex-formats a byte slice, so hotkeys can go straight into tracing
/// fields without allocating unless the event is actually recorded.
pub struct HexSlice<'a>(&'a [u8]);

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    /// The first eight bytes only. Enough to tell hotkeys apart in logs.
    fn short_hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn short_hex(&self) -> HexSlice<'_> {
        let bytes = self.as_ref();
        HexSlice(&bytes[..bytes.len().min(8)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_every_byte() {
        assert_eq!([0x0au8, 0xff, 0x00].short_hex().to_string(), "0aff00");
    }

    #[test]
    fn short_hex_truncates() {
        let key = [0xabu8; 32];
        assert_eq!(key.short_hex().to_string(), "ab".repeat(8));
        assert_eq!([1u8, 2].short_hex().to_string(), "0102");
    }
}
