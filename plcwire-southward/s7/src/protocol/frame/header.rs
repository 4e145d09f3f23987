use super::{
    super::error::{Error, Result},
    types::S7PduType,
};
use bytes::BufMut;

pub const S7_PROTOCOL_ID: u8 = 0x32;

/// S7 header. `error` is present only on Ack/AckData.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Header {
    pub pdu_type: S7PduType,
    pub reserved: u16,
    pub pdu_ref: u16,
    pub param_len: u16,
    pub payload_len: u16,
    pub error: Option<HeaderError>,
}

/// Header-level error class/code pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderError {
    pub class: u8,
    pub code: u8,
}

impl HeaderError {
    pub const NONE: HeaderError = HeaderError { class: 0, code: 0 };

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.class == 0 && self.code == 0
    }

    /// Class 0x81 / code 0x04: the CPU refuses PUT/GET access.
    #[inline]
    pub fn is_access_denied(&self) -> bool {
        self.class == 0x81 && self.code == 0x04
    }
}

impl S7Header {
    pub fn new(pdu_type: S7PduType, pdu_ref: u16) -> Self {
        Self {
            pdu_type,
            reserved: 0,
            pdu_ref,
            param_len: 0,
            payload_len: 0,
            error: pdu_type.has_error_field().then_some(HeaderError::NONE),
        }
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        if self.pdu_type.has_error_field() {
            12
        } else {
            10
        }
    }

    pub fn parse(input: &[u8]) -> Result<(S7Header, &[u8])> {
        if input.len() < 10 {
            return Err(Error::InsufficientData {
                needed: 10,
                available: input.len(),
            });
        }
        if input[0] != S7_PROTOCOL_ID {
            return Err(Error::InvalidFrame);
        }
        let pdu_type = S7PduType::try_from(input[1]).map_err(|_| Error::ProtocolViolation {
            context: "unknown ROSCTR",
        })?;
        let mut rest = &input[10..];
        let error = if pdu_type.has_error_field() {
            if rest.len() < 2 {
                return Err(Error::InsufficientData {
                    needed: 2,
                    available: rest.len(),
                });
            }
            let e = HeaderError {
                class: rest[0],
                code: rest[1],
            };
            rest = &rest[2..];
            Some(e)
        } else {
            None
        };
        Ok((
            S7Header {
                pdu_type,
                reserved: u16::from_be_bytes([input[2], input[3]]),
                pdu_ref: u16::from_be_bytes([input[4], input[5]]),
                param_len: u16::from_be_bytes([input[6], input[7]]),
                payload_len: u16::from_be_bytes([input[8], input[9]]),
                error,
            },
            rest,
        ))
    }

    pub fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(S7_PROTOCOL_ID);
        dst.put_u8(self.pdu_type as u8);
        dst.put_u16(self.reserved);
        dst.put_u16(self.pdu_ref);
        dst.put_u16(self.param_len);
        dst.put_u16(self.payload_len);
        if self.pdu_type.has_error_field() {
            let e = self.error.unwrap_or(HeaderError::NONE);
            dst.put_u8(e.class);
            dst.put_u8(e.code);
        }
    }
}
