use std::{io, ops::Deref};

use byteorder::{ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::pinging::error::{DecodeError, PingError};

pub trait McModernValue: Sized {
    fn read_from(data: &mut impl ReadBytesExt) -> Result<Self, CodecError>;

    fn write_to(&self, target: &mut impl WriteBytesExt) -> Result<(), CodecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInt(pub i32);

impl VarInt {
    const SEGMENT_BITS: i32 = 0x7F;
    const CONTINUE_BIT: i32 = 0x80;
    const MAX_LEN: i32 = 32;

    /// Number of bytes `write_to` produces for this value.
    pub fn encoded_len(&self) -> usize {
        let mut value = self.0 as u32;
        let mut len = 1;
        while value & !(Self::SEGMENT_BITS as u32) != 0 {
            value >>= 7;
            len += 1;
        }
        len
    }
}

impl Deref for VarInt {
    type Target = i32;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl McModernValue for VarInt {
    /// Reads one byte at a time; gives up after five bytes without a terminator.
    fn read_from(data: &mut impl ReadBytesExt) -> Result<Self, CodecError> {
        let mut value = 0;
        let mut position = 0;
        loop {
            let current_byte = data.read_u8()? as i32;
            value |= (current_byte & Self::SEGMENT_BITS) << position;
            if (current_byte & Self::CONTINUE_BIT) == 0 {
                return Ok(Self(value));
            }
            position += 7;
            if position >= Self::MAX_LEN {
                return Err(CodecError::VarIntTooLarge);
            }
        }
    }

    fn write_to(&self, target: &mut impl WriteBytesExt) -> Result<(), CodecError> {
        let mut value = self.0;
        loop {
            if (value & !Self::SEGMENT_BITS) == 0 {
                target.write_u8(value as u8)?;
                return Ok(());
            }

            target.write_u8(((value & Self::SEGMENT_BITS) | Self::CONTINUE_BIT) as u8)?;

            value = ((value as u32) >> 7) as i32;
        }
    }
}

impl McModernValue for String {
    /// Completes the trait; no status field is read as a length-prefixed string.
    fn read_from(data: &mut impl ReadBytesExt) -> Result<Self, CodecError> {
        let len = VarInt::read_from(data)?;
        let mut string_data = vec![0; len.0.max(0) as usize];
        data.read_exact(&mut string_data)?;

        Ok(String::from_utf8_lossy(&string_data).to_string())
    }

    fn write_to(&self, target: &mut impl WriteBytesExt) -> Result<(), CodecError> {
        let string_data = self.as_bytes();

        VarInt(string_data.len() as i32).write_to(target)?;
        target.write_all(string_data)?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("VarInt too large!")]
    VarIntTooLarge,
    #[error("IO error")]
    IoError(#[from] io::Error),
}

impl CodecError {
    pub(crate) fn into_ping_error(self, stage: &'static str) -> PingError {
        match self {
            CodecError::VarIntTooLarge => PingError::Decode(DecodeError::VarIntTooLarge),
            CodecError::IoError(e) => PingError::from_io(stage, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinging::error::FailureKind;

    fn encode(value: i32) -> Vec<u8> {
        let mut out = vec![];
        VarInt(value).write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn varint_roundtrip() {
        for value in [0, 1, 127, 128, 300, i32::MAX] {
            let bytes = encode(value);
            assert_eq!(bytes.len(), VarInt(value).encoded_len());
            let mut slice = bytes.as_slice();
            assert_eq!(VarInt::read_from(&mut slice).unwrap(), VarInt(value));
            assert!(slice.is_empty(), "{} left bytes behind", value);
        }
    }

    #[test]
    fn varint_uses_minimal_groups() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(127), [0x7F]);
        assert_eq!(encode(128), [0x80, 0x01]);
        assert_eq!(encode(300), [0xAC, 0x02]);
        assert_eq!(encode(i32::MAX), [0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
    }

    #[test]
    fn varint_stops_after_its_last_byte() {
        let bytes = [0xAC, 0x02, 0x99];
        let mut slice = &bytes[..];
        assert_eq!(*VarInt::read_from(&mut slice).unwrap(), 300);
        assert_eq!(slice, [0x99]);
    }

    #[test]
    fn varint_without_terminator_is_rejected() {
        let bytes = [0x80; 6];
        let mut slice = &bytes[..];
        let err = VarInt::read_from(&mut slice).unwrap_err();
        assert!(matches!(err, CodecError::VarIntTooLarge));
        assert_eq!(slice.len(), 1, "decoder read past the fifth byte");
        assert_eq!(err.into_ping_error("test").kind(), FailureKind::Decode);
    }

    #[test]
    fn varint_on_empty_input_is_truncation() {
        let mut slice: &[u8] = &[0x80];
        let err = VarInt::read_from(&mut slice).unwrap_err();
        assert_eq!(err.into_ping_error("test").kind(), FailureKind::Protocol);
    }

    #[test]
    fn string_is_length_prefixed() {
        let mut out = vec![];
        "localhost".to_string().write_to(&mut out).unwrap();
        assert_eq!(out[0], 9);
        assert_eq!(&out[1..], b"localhost");
        let mut slice = out.as_slice();
        assert_eq!(String::read_from(&mut slice).unwrap(), "localhost");
    }
}
