use super::{
    super::error::{Error, Result},
    types::CotpType,
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes};

const PARAM_TPDU_SIZE: u8 = 0xC0;
const PARAM_CALLING_TSAP: u8 = 0xC1;
const PARAM_CALLED_TSAP: u8 = 0xC2;

/// TPDU size code 0x07..=0x0D, encoded as a power of two.
pub fn tpdu_size_bytes_from_code(code: u8) -> Option<usize> {
    (0x07..=0x0D).contains(&code).then(|| 1usize << code)
}

/// Largest TPDU size code whose size fits in `bytes`.
pub fn tpdu_size_code_for(bytes: usize) -> u8 {
    (0x07..=0x0D)
        .rev()
        .find(|code| (1usize << code) <= bytes)
        .unwrap_or(0x07)
}

/// Body shared by connection request and connection confirm TPDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    pub class: u8,
    pub tpdu_size: Option<u8>,
    pub calling_tsap: Option<u16>,
    pub called_tsap: Option<u16>,
}

impl ConnectionParams {
    pub fn request(calling_tsap: u16, called_tsap: u16, tpdu_size: u8) -> Self {
        Self {
            dst_ref: 0x0000,
            src_ref: 0x000F,
            class: 0x00,
            tpdu_size: Some(tpdu_size),
            calling_tsap: Some(calling_tsap),
            called_tsap: Some(called_tsap),
        }
    }

    pub fn tpdu_size_bytes(&self) -> Option<usize> {
        self.tpdu_size.and_then(tpdu_size_bytes_from_code)
    }

    fn body_len(&self) -> usize {
        5 + self.tpdu_size.map_or(0, |_| 3)
            + self.calling_tsap.map_or(0, |_| 4)
            + self.called_tsap.map_or(0, |_| 4)
    }

    fn write_body<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.dst_ref);
        dst.put_u16(self.src_ref);
        dst.put_u8(self.class);
        if let Some(size) = self.tpdu_size {
            write_tlv(dst, PARAM_TPDU_SIZE, &[size]);
        }
        if let Some(tsap) = self.calling_tsap {
            write_tlv(dst, PARAM_CALLING_TSAP, &tsap.to_be_bytes());
        }
        if let Some(tsap) = self.called_tsap {
            write_tlv(dst, PARAM_CALLED_TSAP, &tsap.to_be_bytes());
        }
    }

    fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::InsufficientData {
                needed: 5,
                available: body.len(),
            });
        }
        let mut params = ConnectionParams {
            dst_ref: u16::from_be_bytes([body[0], body[1]]),
            src_ref: u16::from_be_bytes([body[2], body[3]]),
            class: body[4],
            tpdu_size: None,
            calling_tsap: None,
            called_tsap: None,
        };
        let mut rest = &body[5..];
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(Error::ProtocolViolation {
                    context: "truncated COTP parameter",
                });
            }
            let (code, len) = (rest[0], rest[1] as usize);
            let value = rest.get(2..2 + len).ok_or(Error::ProtocolViolation {
                context: "COTP parameter length exceeds TPDU",
            })?;
            match (code, value) {
                (PARAM_TPDU_SIZE, [size]) => params.tpdu_size = Some(*size),
                (PARAM_CALLING_TSAP, [hi, lo]) => {
                    params.calling_tsap = Some(u16::from_be_bytes([*hi, *lo]))
                }
                (PARAM_CALLED_TSAP, [hi, lo]) => {
                    params.called_tsap = Some(u16::from_be_bytes([*hi, *lo]))
                }
                // Checksum, version and other optional parameters are ignored.
                _ => {}
            }
            rest = &rest[2 + len..];
        }
        Ok(params)
    }
}

#[inline]
fn write_tlv<B: BufMut>(dst: &mut B, code: u8, bytes: &[u8]) {
    dst.put_u8(code);
    dst.put_u8(bytes.len() as u8);
    dst.put_slice(bytes);
}

/// COTP TPDU (the subset ISO-on-TCP uses)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cotp {
    /// Connection request
    Cr(ConnectionParams),
    /// Connection confirm
    Cc(ConnectionParams),
    /// Disconnect request
    Dr { dst_ref: u16, src_ref: u16, reason: u8 },
    /// Disconnect confirm
    Dc { dst_ref: u16, src_ref: u16 },
    /// Data
    D { eot: bool, tpdu_nr: u8 },
}

impl Cotp {
    pub fn data() -> Self {
        Cotp::D {
            eot: true,
            tpdu_nr: 0,
        }
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(self, Cotp::D { .. })
    }

    fn kind(&self) -> CotpType {
        match self {
            Cotp::Cr(_) => CotpType::Cr,
            Cotp::Cc(_) => CotpType::Cc,
            Cotp::Dr { .. } => CotpType::Dr,
            Cotp::Dc { .. } => CotpType::Dc,
            Cotp::D { .. } => CotpType::D,
        }
    }

    /// Length indicator value: everything after the LI byte.
    fn li(&self) -> usize {
        1 + match self {
            Cotp::Cr(p) | Cotp::Cc(p) => p.body_len(),
            Cotp::Dr { .. } => 5,
            Cotp::Dc { .. } => 4,
            Cotp::D { .. } => 1,
        }
    }
}

impl WireEncode for Cotp {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        1 + self.li()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        dst.put_u8(self.li() as u8);
        dst.put_u8(self.kind() as u8);
        match self {
            Cotp::Cr(p) | Cotp::Cc(p) => p.write_body(dst),
            Cotp::Dr {
                dst_ref,
                src_ref,
                reason,
            } => {
                dst.put_u16(*dst_ref);
                dst.put_u16(*src_ref);
                dst.put_u8(*reason);
            }
            Cotp::Dc { dst_ref, src_ref } => {
                dst.put_u16(*dst_ref);
                dst.put_u16(*src_ref);
            }
            Cotp::D { eot, tpdu_nr } => {
                dst.put_u8(if *eot { 0x80 } else { 0x00 } | (tpdu_nr & 0x7F));
            }
        }
        Ok(())
    }
}

impl WireDecode for Cotp {
    type Error = Error;
    type Context = ();

    /// Consumes LI + 1 bytes; for data TPDUs the returned rest is the user payload.
    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        if input.len() < 2 {
            return Err(Error::InsufficientData {
                needed: 2,
                available: input.len(),
            });
        }
        let li = input[0] as usize;
        if li < 1 || 1 + li > input.len() {
            return Err(Error::ProtocolViolation {
                context: "invalid COTP LI",
            });
        }
        let body = &input[2..1 + li];
        let rest = &input[1 + li..];
        let kind = CotpType::try_from(input[1]).map_err(|_| Error::ProtocolViolation {
            context: "unknown COTP PDU type",
        })?;
        let cotp = match kind {
            CotpType::Cr => Cotp::Cr(ConnectionParams::parse_body(body)?),
            CotpType::Cc => Cotp::Cc(ConnectionParams::parse_body(body)?),
            CotpType::Dr => {
                if body.len() < 5 {
                    return Err(Error::InvalidFrame);
                }
                Cotp::Dr {
                    dst_ref: u16::from_be_bytes([body[0], body[1]]),
                    src_ref: u16::from_be_bytes([body[2], body[3]]),
                    reason: body[4],
                }
            }
            CotpType::Dc => {
                if body.len() < 4 {
                    return Err(Error::InvalidFrame);
                }
                Cotp::Dc {
                    dst_ref: u16::from_be_bytes([body[0], body[1]]),
                    src_ref: u16::from_be_bytes([body[2], body[3]]),
                }
            }
            CotpType::D => {
                let flags = *body.first().ok_or(Error::InvalidFrame)?;
                Cotp::D {
                    eot: flags & 0x80 != 0,
                    tpdu_nr: flags & 0x7F,
                }
            }
        };
        Ok((rest, cotp))
    }
}
