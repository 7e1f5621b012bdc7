use crate::error::BinaryError;
use crate::io::{BinaryReader, BinaryWriter};

/// Trait for types that can be read from a `BinaryReader`.
pub trait Readable: Sized {
    /// Reads an instance of `Self` from the reader.
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError>;
}

/// Trait for types that can be written to a `BinaryWriter`.
pub trait Writable {
    /// Writes this instance to the writer.
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError>;
}

macro_rules! impl_primitive_readable {
    ($($ty:ty => $method:ident),*) => {
        $(
            impl Readable for $ty {
                #[inline]
                fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
                    reader.$method()
                }
            }
        )*
    };
}

macro_rules! impl_primitive_writable {
    ($($ty:ty => $method:ident),*) => {
        $(
            impl Writable for $ty {
                #[inline]
                fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
                    writer.$method(*self)
                }
            }
        )*
    };
}

impl_primitive_readable! {
    u8 => read_u8, i8 => read_i8,
    u16 => read_u16, i16 => read_i16,
    u32 => read_u32, i32 => read_i32,
    u64 => read_u64, i64 => read_i64,
    bool => read_bool
}

impl_primitive_writable! {
    u8 => write_u8, i8 => write_i8,
    u16 => write_u16, i16 => write_i16,
    u32 => write_u32, i32 => write_i32,
    u64 => write_u64, i64 => write_i64,
    bool => write_bool
}

// Option<T>
impl<T: Readable> Readable for Option<T> {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        if reader.read_bool()? {
            Ok(Some(T::read(reader)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Writable> Writable for Option<T> {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        if let Some(value) = self {
            writer.write_bool(true)?;
            value.write(writer)?;
        } else {
            writer.write_bool(false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn option_round_trips_both_variants() {
        let mut writer = BinaryWriter::new();
        Some(7u16).write(&mut writer).unwrap();
        None::<u16>.write(&mut writer).unwrap();

        let mut reader = BinaryReader::new(writer.freeze());
        assert_eq!(Option::<u16>::read(&mut reader).unwrap(), Some(7));
        assert_eq!(Option::<u16>::read(&mut reader).unwrap(), None);
    }

    #[test]
    fn primitive_read_matches_write() {
        let mut writer = BinaryWriter::new();
        42u8.write(&mut writer).unwrap();
        let mut reader = BinaryReader::new(Bytes::from(writer.freeze()));
        assert_eq!(u8::read(&mut reader).unwrap(), 42);
    }
}
