use super::{
    super::error::{Error, Result},
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes};

pub const TPKT_HEADER_LEN: usize = 4;

/// RFC 1006 frame header
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Tpkt {
    pub version: u8,
    pub reserved: u8,
    /// Total length including this header
    pub length: u16,
}

impl Tpkt {
    pub fn for_payload(payload_len: usize) -> Self {
        Self {
            version: 0x03,
            reserved: 0x00,
            length: (TPKT_HEADER_LEN + payload_len) as u16,
        }
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(TPKT_HEADER_LEN)
    }
}

impl WireEncode for Tpkt {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        TPKT_HEADER_LEN
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        dst.put_u8(self.version);
        dst.put_u8(self.reserved);
        dst.put_u16(self.length);
        Ok(())
    }
}

impl WireDecode for Tpkt {
    type Error = Error;
    type Context = ();

    /// Parses the header and returns the bytes following the whole frame.
    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        if input.len() < TPKT_HEADER_LEN {
            return Err(Error::InsufficientData {
                needed: TPKT_HEADER_LEN,
                available: input.len(),
            });
        }
        if input[0] != 0x03 || input[1] != 0x00 {
            return Err(Error::InvalidFrame);
        }
        let length = u16::from_be_bytes([input[2], input[3]]) as usize;
        if length < TPKT_HEADER_LEN || length > input.len() {
            return Err(Error::InvalidFrame);
        }
        Ok((
            &input[length..],
            Tpkt {
                version: input[0],
                reserved: input[1],
                length: length as u16,
            },
        ))
    }
}
