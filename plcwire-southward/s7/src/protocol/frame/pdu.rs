use super::{
    super::error::{Error, Result},
    header::{HeaderError, S7Header},
    types::S7PduType,
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes, BytesMut};

/// S7 PDU: header plus zero-copy parameter and data sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Pdu {
    pub header: S7Header,
    pub param: Bytes,
    pub payload: Bytes,
}

impl S7Pdu {
    /// Builds a PDU, fixing up the header lengths.
    pub fn new(mut header: S7Header, param: Bytes, payload: Bytes) -> Self {
        header.param_len = param.len() as u16;
        header.payload_len = payload.len() as u16;
        Self {
            header,
            param,
            payload,
        }
    }

    pub fn job(pdu_ref: u16, param: Bytes, payload: Bytes) -> Self {
        Self::new(S7Header::new(S7PduType::Job, pdu_ref), param, payload)
    }

    pub fn user_data(pdu_ref: u16, param: Bytes, payload: Bytes) -> Self {
        Self::new(S7Header::new(S7PduType::UserData, pdu_ref), param, payload)
    }

    pub fn ack_data(pdu_ref: u16, param: Bytes, payload: Bytes) -> Self {
        Self::new(S7Header::new(S7PduType::AckData, pdu_ref), param, payload)
    }

    #[inline]
    pub fn pdu_ref(&self) -> u16 {
        self.header.pdu_ref
    }

    /// Rewrites the transaction identifier, used when a request was built before its slot.
    #[inline]
    pub fn with_pdu_ref(mut self, pdu_ref: u16) -> Self {
        self.header.pdu_ref = pdu_ref;
        self
    }

    #[inline]
    pub fn header_error(&self) -> HeaderError {
        self.header.error.unwrap_or(HeaderError::NONE)
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        matches!(self.header.pdu_type, S7PduType::Ack | S7PduType::AckData)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len(&()));
        self.header.encode_to(&mut buf);
        buf.put_slice(&self.param);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

impl WireEncode for S7Pdu {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        self.header.encoded_len() + self.param.len() + self.payload.len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        self.header.encode_to(dst);
        dst.put_slice(&self.param);
        dst.put_slice(&self.payload);
        Ok(())
    }
}

impl WireDecode for S7Pdu {
    type Error = Error;
    type Context = ();

    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        let (header, rest) = S7Header::parse(input)?;
        let param_len = header.param_len as usize;
        let need = param_len + header.payload_len as usize;
        if rest.len() < need {
            return Err(Error::InsufficientData {
                needed: need,
                available: rest.len(),
            });
        }
        let (param, tail) = rest.split_at(param_len);
        let (payload, remain) = tail.split_at(header.payload_len as usize);
        Ok((
            remain,
            S7Pdu {
                header,
                param: Bytes::slice_ref(parent, param),
                payload: Bytes::slice_ref(parent, payload),
            },
        ))
    }
}
