use crate::error::{BinaryError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Cursor over an immutable byte buffer, used to decode wire structures.
#[derive(Debug, Clone)]
pub struct BinaryReader {
    buffer: Bytes,
}

/// Growable byte buffer, used to encode wire structures.
#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buffer: BytesMut,
}

macro_rules! check_remaining {
    ($reader:expr, $len:expr) => {{
        let needed = $len;
        let remaining = $reader.buffer.remaining();
        if remaining < needed {
            return Err(BinaryError::UnexpectedEof { needed, remaining });
        }
    }};
}

impl BinaryReader {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        check_remaining!(self, 1);
        Ok(self.buffer.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        check_remaining!(self, 1);
        Ok(self.buffer.get_i8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.buffer.get_u16_le())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        check_remaining!(self, 2);
        Ok(self.buffer.get_i16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        check_remaining!(self, 4);
        Ok(self.buffer.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        check_remaining!(self, 4);
        Ok(self.buffer.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        check_remaining!(self, 8);
        Ok(self.buffer.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        check_remaining!(self, 8);
        Ok(self.buffer.get_i64_le())
    }

    /// Reads `len` raw bytes, advancing past them.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        check_remaining!(self, len);
        Ok(self.buffer.copy_to_bytes(len))
    }

    /// Consumes and returns everything left in the buffer.
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.buffer.remaining();
        self.buffer.copy_to_bytes(len)
    }

    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        check_remaining!(self, dst.len());
        self.buffer.copy_to_slice(dst);
        Ok(())
    }
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.buffer.put_u8(value);
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.buffer.put_i8(value);
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.buffer.put_u16_le(value);
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.buffer.put_i16_le(value);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.buffer.put_u32_le(value);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.buffer.put_i32_le(value);
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.buffer.put_u64_le(value);
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.buffer.put_i64_le(value);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.put_slice(bytes);
        Ok(())
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_shaped_values() {
        let mut writer = BinaryWriter::new();
        writer.write_u16(0x4242).unwrap();
        writer.write_u16(1001).unwrap();
        writer.write_u8(0b0000_0001).unwrap();
        writer.write_bytes(b"hi").unwrap();

        let mut reader = BinaryReader::new(writer.freeze());
        assert_eq!(reader.read_u16().unwrap(), 0x4242);
        assert_eq!(reader.read_u16().unwrap(), 1001);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(&reader.read_remaining()[..], b"hi");
    }

    #[test]
    fn short_buffer_is_unexpected_eof() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[0x01]));
        match reader.read_u16() {
            Err(BinaryError::UnexpectedEof { needed, remaining }) => {
                assert_eq!(needed, 2);
                assert_eq!(remaining, 1);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }
}
