//! Little-endian serialization used by the index and block codecs.

use copperd_consensus::Hash256;

const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.write_u8(value as u8);
        } else if value <= 0xffff {
            self.write_u8(0xfd);
            self.write_u16_le(value as u16);
        } else if value <= 0xffff_ffff {
            self.write_u8(0xfe);
            self.write_u32_le(value as u32);
        } else {
            self.write_u8(0xff);
            self.write_u64_le(value);
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalVarInt,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of input"),
            DecodeError::NonCanonicalVarInt => write!(f, "non-canonical CompactSize"),
            DecodeError::SizeTooLarge => write!(f, "compact size exceeds maximum"),
            DecodeError::InvalidData(message) => write!(f, "{message}"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after decode"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.input.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.input[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(out))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(out))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_hash_le(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0xfd => {
                let value = self.read_u16_le()? as u64;
                if value < 0xfd {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xfe => {
                let value = self.read_u32_le()? as u64;
                if value <= 0xffff {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xff => {
                let value = self.read_u64_le()?;
                if value <= 0xffff_ffff {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            _ => prefix as u64,
        };
        if value > MAX_COMPACT_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varint()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scalars() {
        let mut encoder = Encoder::new();
        encoder.write_u8(7);
        encoder.write_u32_le(0xdead_beef);
        encoder.write_i32_le(-5);
        encoder.write_u64_le(u64::MAX);
        encoder.write_i64_le(-1);
        let bytes = encoder.into_inner();

        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_u8().unwrap(), 7);
        assert_eq!(decoder.read_u32_le().unwrap(), 0xdead_beef);
        assert_eq!(decoder.read_i32_le().unwrap(), -5);
        assert_eq!(decoder.read_u64_le().unwrap(), u64::MAX);
        assert_eq!(decoder.read_i64_le().unwrap(), -1);
        assert!(decoder.is_empty());
    }

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0x01ff_ffff] {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            let bytes = encoder.into_inner();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_varint().unwrap(), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn varint_rejects_non_canonical() {
        // 0xfd prefix carrying a value that fits in a single byte.
        let mut decoder = Decoder::new(&[0xfd, 0x01, 0x00]);
        assert_eq!(
            decoder.read_varint().unwrap_err(),
            DecodeError::NonCanonicalVarInt
        );
    }

    #[test]
    fn varint_rejects_oversize() {
        let mut encoder = Encoder::new();
        encoder.write_varint(MAX_COMPACT_SIZE + 1);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_varint().unwrap_err(), DecodeError::SizeTooLarge);
    }

    #[test]
    fn eof_detection() {
        let mut decoder = Decoder::new(&[1, 2]);
        assert_eq!(decoder.read_u32_le().unwrap_err(), DecodeError::UnexpectedEof);
    }
}
