//! Item serializers
//!
//! An [`ItemSerializer`] turns one item into the exact byte count it
//! declares through `calculate_size`. Containers check that contract on
//! every write.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::marker::PhantomData;

/// Serialization capability for items of type `T`
pub trait ItemSerializer<T>: Send + Sync {
    /// Bytes `serialize` will write for `item`
    fn calculate_size(&self, item: &T) -> u64;

    fn serialize(&self, item: &T, writer: &mut dyn Write) -> Result<()>;

    /// Read one item occupying exactly `byte_len` bytes
    fn deserialize(&self, reader: &mut dyn Read, byte_len: u64) -> Result<T>;

    /// Size shared by every item, if there is one
    fn constant_size(&self) -> Option<u64> {
        None
    }
}

fn read_exact_vec(reader: &mut dyn Read, byte_len: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; byte_len as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::Serialization(format!("Short read of {} bytes: {}", byte_len, e)))?;
    Ok(buf)
}

macro_rules! fixed_width_serializer {
    ($name:ident, $ty:ty, $width:expr) => {
        #[doc = concat!("Little-endian `", stringify!($ty), "`")]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl ItemSerializer<$ty> for $name {
            fn calculate_size(&self, _item: &$ty) -> u64 {
                $width
            }

            fn serialize(&self, item: &$ty, writer: &mut dyn Write) -> Result<()> {
                writer.write_all(&item.to_le_bytes())?;
                Ok(())
            }

            fn deserialize(&self, reader: &mut dyn Read, byte_len: u64) -> Result<$ty> {
                if byte_len != $width {
                    return Err(Error::Serialization(format!(
                        "{} expects {} bytes, stream holds {}",
                        stringify!($ty),
                        $width,
                        byte_len
                    )));
                }
                let mut buf = [0u8; $width];
                reader.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }

            fn constant_size(&self) -> Option<u64> {
                Some($width)
            }
        }
    };
}

fixed_width_serializer!(I32Serializer, i32, 4);
fixed_width_serializer!(U32Serializer, u32, 4);
fixed_width_serializer!(I64Serializer, i64, 8);
fixed_width_serializer!(U64Serializer, u64, 8);

/// UTF-8 text, no length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl ItemSerializer<String> for StringSerializer {
    fn calculate_size(&self, item: &String) -> u64 {
        item.len() as u64
    }

    fn serialize(&self, item: &String, writer: &mut dyn Write) -> Result<()> {
        writer.write_all(item.as_bytes())?;
        Ok(())
    }

    fn deserialize(&self, reader: &mut dyn Read, byte_len: u64) -> Result<String> {
        String::from_utf8(read_exact_vec(reader, byte_len)?)
            .map_err(|e| Error::Serialization(format!("Invalid UTF-8: {}", e)))
    }
}

/// Raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl ItemSerializer<Vec<u8>> for BytesSerializer {
    fn calculate_size(&self, item: &Vec<u8>) -> u64 {
        item.len() as u64
    }

    fn serialize(&self, item: &Vec<u8>, writer: &mut dyn Write) -> Result<()> {
        writer.write_all(item)?;
        Ok(())
    }

    fn deserialize(&self, reader: &mut dyn Read, byte_len: u64) -> Result<Vec<u8>> {
        read_exact_vec(reader, byte_len)
    }
}

/// Any serde type, encoded as JSON
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ItemSerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn calculate_size(&self, item: &T) -> u64 {
        // serde_json only fails on non-string map keys and failing Serialize
        // impls; those surface again from `serialize`
        serde_json::to_vec(item).map(|v| v.len() as u64).unwrap_or(0)
    }

    fn serialize(&self, item: &T, writer: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(writer, item).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize(&self, reader: &mut dyn Read, byte_len: u64) -> Result<T> {
        let bytes = read_exact_vec(reader, byte_len)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Key/value pair: `[key_len u32][key][value]`
pub struct PairSerializer<A, B> {
    first: Box<dyn ItemSerializer<A>>,
    second: Box<dyn ItemSerializer<B>>,
}

impl<A, B> PairSerializer<A, B> {
    pub fn new(
        first: impl ItemSerializer<A> + 'static,
        second: impl ItemSerializer<B> + 'static,
    ) -> Self {
        Self {
            first: Box::new(first),
            second: Box::new(second),
        }
    }
}

impl<A, B> ItemSerializer<(A, B)> for PairSerializer<A, B> {
    fn calculate_size(&self, item: &(A, B)) -> u64 {
        4 + self.first.calculate_size(&item.0) + self.second.calculate_size(&item.1)
    }

    fn serialize(&self, item: &(A, B), writer: &mut dyn Write) -> Result<()> {
        let key_len = u32::try_from(self.first.calculate_size(&item.0))
            .map_err(|_| Error::Serialization("Key longer than 4 GiB".to_string()))?;
        writer.write_all(&key_len.to_le_bytes())?;
        self.first.serialize(&item.0, writer)?;
        self.second.serialize(&item.1, writer)
    }

    fn deserialize(&self, reader: &mut dyn Read, byte_len: u64) -> Result<(A, B)> {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let key_len = u32::from_le_bytes(len) as u64;
        let value_len = byte_len.checked_sub(4 + key_len).ok_or_else(|| {
            Error::Serialization(format!(
                "Pair key of {} bytes exceeds item of {} bytes",
                key_len, byte_len
            ))
        })?;
        let first = self.first.deserialize(reader, key_len)?;
        let second = self.second.deserialize(reader, value_len)?;
        Ok((first, second))
    }

    fn constant_size(&self) -> Option<u64> {
        Some(4 + self.first.constant_size()? + self.second.constant_size()?)
    }
}
