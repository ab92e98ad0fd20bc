use crate::error::{OffcryptoError, Result};

/// Little-endian cursor over a borrowed buffer; every read names the field it is decoding.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8]> {
        let end = self.pos.saturating_add(n);
        if end > self.bytes.len() {
            return Err(OffcryptoError::Truncated { context });
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u16_le(&mut self, context: &'static str) -> Result<u16> {
        let b = self.take(2, context)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32_le(&mut self, context: &'static str) -> Result<u32> {
        let b = self.take(4, context)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64_le(&mut self, context: &'static str) -> Result<u64> {
        let b = self.take(8, context)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_advance_and_report_the_failing_field() {
        let bytes = [1, 0, 2, 0, 0, 0, 9];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u16_le("a").expect("a"), 1);
        assert_eq!(r.read_u32_le("b").expect("b"), 2);
        assert_eq!(r.remaining(), &[9]);
        match r.read_u64_le("tail") {
            Err(OffcryptoError::Truncated { context }) => assert_eq!(context, "tail"),
            other => panic!("expected truncation, got {other:?}"),
        }
    }
}
