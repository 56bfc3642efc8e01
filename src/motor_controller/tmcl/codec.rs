//! Trinamic TMCL binary frames.
//!
//! Request: `[module, command, type, motor, value (i32 BE), checksum]`.
//! Reply: `[reply address, module, status, command, value (i32 BE), checksum]`.
//! The checksum is the sum of the first eight bytes, modulo 256.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::motor_controller::DriverError;

pub const FRAME_LEN: usize = 9;

pub const CMD_MST: u8 = 3;
pub const CMD_MVP: u8 = 4;
pub const CMD_SAP: u8 = 5;
pub const CMD_GAP: u8 = 6;
pub const CMD_SGP: u8 = 9;
pub const CMD_RFS: u8 = 13;

pub const MVP_ABSOLUTE: u8 = 0;
pub const MVP_RELATIVE: u8 = 1;
pub const RFS_START: u8 = 0;

pub const STATUS_SUCCESS: u8 = 100;
pub const STATUS_EEPROM_LOADED: u8 = 101;

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmclRequest {
    pub module: u8,
    pub command: u8,
    pub type_number: u8,
    pub motor: u8,
    pub value: i32,
}

impl TmclRequest {
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = self.module;
        frame[1] = self.command;
        frame[2] = self.type_number;
        frame[3] = self.motor;
        frame[4..8].copy_from_slice(&self.value.to_be_bytes());
        frame[8] = checksum(&frame[..8]);
        frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmclReply {
    pub reply_address: u8,
    pub module: u8,
    pub status: u8,
    pub command: u8,
    pub value: i32,
}

impl TmclReply {
    pub fn from_bytes(frame: &[u8; FRAME_LEN]) -> Result<Self, DriverError> {
        let expected = checksum(&frame[..8]);
        if frame[8] != expected {
            return Err(DriverError::InvalidResponse(format!(
                "checksum {:#04x}, expected {:#04x}",
                frame[8], expected
            )));
        }
        Ok(Self {
            reply_address: frame[0],
            module: frame[1],
            status: frame[2],
            command: frame[3],
            value: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, STATUS_SUCCESS | STATUS_EEPROM_LOADED)
    }
}

#[derive(Debug, Default)]
pub struct TmclCodec;

impl Encoder<TmclRequest> for TmclCodec {
    type Error = DriverError;

    fn encode(&mut self, item: TmclRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_LEN);
        dst.put_slice(&item.to_bytes());
        Ok(())
    }
}

impl Decoder for TmclCodec {
    type Item = TmclReply;
    type Error = DriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_LEN {
            return Ok(None);
        }
        let mut frame = [0u8; FRAME_LEN];
        frame.copy_from_slice(&src[..FRAME_LEN]);
        src.advance(FRAME_LEN);
        TmclReply::from_bytes(&frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let request = TmclRequest {
            module: 1,
            command: CMD_MVP,
            type_number: MVP_ABSOLUTE,
            motor: 0,
            value: 1_536_000,
        };
        let bytes = request.to_bytes();
        assert_eq!(&bytes[..8], &[1, 4, 0, 0, 0x00, 0x17, 0x70, 0x00]);
        assert_eq!(bytes[8], (1u32 + 4 + 0x17 + 0x70) as u8);
    }

    #[test]
    fn test_checksum_wraps() {
        let request = TmclRequest {
            module: 0xff,
            command: CMD_SAP,
            type_number: 4,
            motor: 2,
            value: -1,
        };
        let bytes = request.to_bytes();
        let sum: u32 = bytes[..8].iter().map(|b| u32::from(*b)).sum();
        assert_eq!(bytes[8], (sum % 256) as u8);
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let mut codec = TmclCodec;
        let mut frame = [2u8, 1, STATUS_SUCCESS, CMD_GAP, 0xff, 0xff, 0xff, 0xfe, 0];
        frame[8] = checksum(&frame[..8]);

        let mut buf = BytesMut::from(&frame[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[5..]);
        let reply = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.value, -2);
        assert_eq!(reply.command, CMD_GAP);
        assert!(reply.is_success());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut codec = TmclCodec;
        let mut buf = BytesMut::from(&[2u8, 1, 100, 6, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DriverError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_error_status() {
        let mut frame = [2u8, 1, 4, CMD_MVP, 0, 0, 0, 0, 0];
        frame[8] = checksum(&frame[..8]);
        assert!(!TmclReply::from_bytes(&frame).unwrap().is_success());
    }
}
