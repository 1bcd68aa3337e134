use core::fmt;

/// Renders bytes as space separated, zero padded hex pairs, e.g. `45 00 E0`.
pub struct HexBytes<'a>(&'a [u8]);

impl<'a> HexBytes<'a> {
    fn new<T>(data: &'a T) -> HexBytes<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexBytes(data.as_ref())
    }
}

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.0.iter();
        if let Some(first) = bytes.next() {
            write!(f, "{:02X}", first)?;
        }
        for byte in bytes {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexBytes<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexBytes<'_> {
        HexBytes::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_and_separates() {
        assert_eq!([0x45u8, 0x00, 0xE0].hex().to_string(), "45 00 E0");
        assert_eq!(format!("{:?}", [0x0Au8].hex()), "[0A]");
        assert_eq!(Vec::<u8>::new().hex().to_string(), "");
    }
}
