//! Parameter and data sections of the S7 messages this driver speaks.
use super::{
    super::error::{Error, Result},
    addr::S7Tag,
    types::{
        subfunction, CpuFunctionGroup, CpuFunctionType, DataTransportSize, S7Function,
        S7ReturnCode,
    },
};
use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, u8 as nom_u8},
    IResult,
};

type NomError<'a> = nom::error::Error<&'a [u8]>;

#[inline]
fn frame_err(_: nom::Err<NomError<'_>>) -> Error {
    Error::InvalidFrame
}

/// Key the CPU expects in a message-service subscription.
pub const MESSAGE_SERVICE_KEY: &[u8; 8] = b"HmiRtm  ";

/// Parameter of the setup-communication job and its ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupCommunication {
    pub amq_caller: u16,
    pub amq_callee: u16,
    pub pdu_len: u16,
}

impl SetupCommunication {
    pub fn encode(&self) -> Bytes {
        let mut p = BytesMut::with_capacity(8);
        p.put_u8(S7Function::SetupCommunication as u8);
        p.put_u8(0x00);
        p.put_u16(self.amq_caller);
        p.put_u16(self.amq_callee);
        p.put_u16(self.pdu_len);
        p.freeze()
    }

    pub fn parse(param: &[u8]) -> Result<Self> {
        fn inner(i: &[u8]) -> IResult<&[u8], SetupCommunication, NomError<'_>> {
            let (i, _function) = nom_u8(i)?;
            let (i, _reserved) = nom_u8(i)?;
            let (i, amq_caller) = be_u16(i)?;
            let (i, amq_callee) = be_u16(i)?;
            let (i, pdu_len) = be_u16(i)?;
            Ok((
                i,
                SetupCommunication {
                    amq_caller,
                    amq_callee,
                    pdu_len,
                },
            ))
        }
        if param.first() != Some(&(S7Function::SetupCommunication as u8)) {
            return Err(Error::UnexpectedPdu {
                context: "expected setup communication parameter",
            });
        }
        inner(param).map(|(_, s)| s).map_err(frame_err)
    }
}

/// ReadVar job parameter: function, item count, S7ANY items.
pub fn read_var_param(tags: &[S7Tag]) -> Bytes {
    let mut p = BytesMut::with_capacity(2 + tags.len() * 12);
    p.put_u8(S7Function::ReadVar as u8);
    p.put_u8(tags.len() as u8);
    for tag in tags {
        tag.encode_any_item(&mut p);
    }
    p.freeze()
}

/// WriteVar job parameter and data section.
pub fn write_var_request(items: &[(&S7Tag, Bytes)]) -> (Bytes, Bytes) {
    let mut p = BytesMut::with_capacity(2 + items.len() * 12);
    p.put_u8(S7Function::WriteVar as u8);
    p.put_u8(items.len() as u8);
    let mut d = BytesMut::new();
    for (idx, (tag, data)) in items.iter().enumerate() {
        tag.encode_any_item(&mut p);
        DataItem {
            return_code: S7ReturnCode::Reserved,
            transport: tag.data_transport_size(),
            data: data.clone(),
        }
        .encode_to(&mut d, idx + 1 == items.len());
    }
    (p.freeze(), d.freeze())
}

/// Function code and item count of a ReadVar/WriteVar ack.
pub fn parse_var_response_param(param: &[u8]) -> Result<(u8, u8)> {
    match param {
        [function, count, ..] => Ok((*function, *count)),
        _ => Err(Error::InsufficientData {
            needed: 2,
            available: param.len(),
        }),
    }
}

/// One item of a data section: read results, write values, user-data payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub return_code: S7ReturnCode,
    pub transport: DataTransportSize,
    pub data: Bytes,
}

impl DataItem {
    pub fn ok(transport: DataTransportSize, data: Bytes) -> Self {
        Self {
            return_code: S7ReturnCode::Success,
            transport,
            data,
        }
    }

    /// Items are padded to even length except the last one.
    pub fn encode_to<B: BufMut>(&self, dst: &mut B, last: bool) {
        dst.put_u8(self.return_code.into());
        dst.put_u8(self.transport as u8);
        let len = if self.transport.length_in_bits() {
            if self.transport == DataTransportSize::Bit {
                self.data.len()
            } else {
                self.data.len() * 8
            }
        } else {
            self.data.len()
        };
        dst.put_u16(len as u16);
        dst.put_slice(&self.data);
        if !last && self.data.len() % 2 == 1 {
            dst.put_u8(0x00);
        }
    }

    fn parse<'a>(input: &'a [u8], parent: &Bytes) -> IResult<&'a [u8], DataItem, NomError<'a>> {
        let (i, return_code) = nom_u8(input)?;
        let (i, transport_raw) = nom_u8(i)?;
        let (i, len_field) = be_u16(i)?;
        let transport = DataTransportSize::try_from(transport_raw).unwrap_or(DataTransportSize::Null);
        let byte_len = match transport {
            DataTransportSize::Bit => len_field as usize,
            t if t.length_in_bits() => (len_field as usize).div_ceil(8),
            _ => len_field as usize,
        };
        let (i, data) = if S7ReturnCode::from(return_code) == S7ReturnCode::Success {
            take(byte_len)(i)?
        } else {
            // Failed items carry no data.
            (i, &i[..0])
        };
        // Fill byte after odd-length items, if present.
        let i = if data.len() % 2 == 1 && !i.is_empty() {
            &i[1..]
        } else {
            i
        };
        Ok((
            i,
            DataItem {
                return_code: S7ReturnCode::from(return_code),
                transport,
                data: if data.is_empty() {
                    Bytes::new()
                } else {
                    Bytes::slice_ref(parent, data)
                },
            },
        ))
    }
}

/// Parse every item of a data section.
pub fn parse_data_items(payload: &Bytes) -> Result<Vec<DataItem>> {
    let mut items = Vec::new();
    let mut rest: &[u8] = payload;
    while !rest.is_empty() {
        let (r, item) = DataItem::parse(rest, payload).map_err(frame_err)?;
        items.push(item);
        rest = r;
    }
    Ok(items)
}

/// WriteVar ack data section: one return code per item.
pub fn parse_write_response(payload: &[u8]) -> Vec<S7ReturnCode> {
    payload.iter().map(|b| S7ReturnCode::from(*b)).collect()
}

/// UserData parameter head (method 0x11 request / 0x12 response)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDataParam {
    pub method: u8,
    pub kind: CpuFunctionType,
    pub group: u8,
    pub subfunction: u8,
    pub sequence: u8,
    pub error_code: u16,
}

impl UserDataParam {
    pub fn request(group: CpuFunctionGroup, subfunction: u8, sequence: u8) -> Self {
        Self {
            method: 0x11,
            kind: CpuFunctionType::Request,
            group: group as u8,
            subfunction,
            sequence,
            error_code: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let extended = self.kind != CpuFunctionType::Request;
        let mut p = BytesMut::with_capacity(12);
        p.put_slice(&[0x00, 0x01, 0x12]);
        p.put_u8(if extended { 8 } else { 4 });
        p.put_u8(self.method);
        p.put_u8(((self.kind as u8) << 4) | (self.group & 0x0F));
        p.put_u8(self.subfunction);
        p.put_u8(self.sequence);
        if extended {
            p.put_u8(0x00);
            p.put_u8(0x00);
            p.put_u16(self.error_code);
        }
        p.freeze()
    }

    pub fn parse(param: &[u8]) -> Result<Self> {
        fn inner(i: &[u8]) -> IResult<&[u8], (u8, u8, u8, u8, u8, &[u8]), NomError<'_>> {
            let (i, _head) = take(3usize)(i)?;
            let (i, len) = nom_u8(i)?;
            let (i, method) = nom_u8(i)?;
            let (i, type_group) = nom_u8(i)?;
            let (i, subfunction) = nom_u8(i)?;
            let (i, sequence) = nom_u8(i)?;
            let (i, ext) = take((len as usize).saturating_sub(4))(i)?;
            Ok((i, (method, type_group, subfunction, sequence, len, ext)))
        }
        let (_, (method, type_group, subfunction, sequence, _len, ext)) =
            inner(param).map_err(frame_err)?;
        let kind = CpuFunctionType::try_from(type_group >> 4).map_err(|_| {
            Error::ProtocolViolation {
                context: "unknown user-data function type",
            }
        })?;
        let error_code = match ext {
            [_, _, hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => 0,
        };
        Ok(Self {
            method,
            kind,
            group: type_group & 0x0F,
            subfunction,
            sequence,
            error_code,
        })
    }
}

/// SZL read request payload.
pub fn szl_request_payload(szl_id: u16, index: u16) -> Bytes {
    let mut d = BytesMut::with_capacity(8);
    DataItem::ok(DataTransportSize::OctetString, {
        let mut b = BytesMut::with_capacity(4);
        b.put_u16(szl_id);
        b.put_u16(index);
        b.freeze()
    })
    .encode_to(&mut d, true);
    d.freeze()
}

/// SZL response data: (szl id, index, records).
pub fn parse_szl_response(data: &[u8]) -> Result<(u16, u16, Vec<&[u8]>)> {
    fn inner(i: &[u8]) -> IResult<&[u8], (u16, u16, Vec<&[u8]>), NomError<'_>> {
        let (i, szl_id) = be_u16(i)?;
        let (i, index) = be_u16(i)?;
        let (i, record_len) = be_u16(i)?;
        let (mut i, count) = be_u16(i)?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (r, rec) = take(record_len as usize)(i)?;
            records.push(rec);
            i = r;
        }
        Ok((i, (szl_id, index, records)))
    }
    inner(data).map(|(_, v)| v).map_err(frame_err)
}

/// Message-service subscription payload; a zero mask cancels the subscription.
pub fn message_service_payload(event_mask: u8, with_alarms: bool) -> Bytes {
    let mut body = BytesMut::with_capacity(12);
    body.put_u8(event_mask);
    body.put_u8(0x00);
    body.put_slice(MESSAGE_SERVICE_KEY);
    if with_alarms {
        // ALARM_S initiate
        body.put_u8(0x02);
        body.put_u8(0x00);
    }
    let mut d = BytesMut::new();
    DataItem::ok(DataTransportSize::OctetString, body.freeze()).encode_to(&mut d, true);
    d.freeze()
}

/// Cyclic read subscription payload: item count, time base, factor, S7ANY items.
pub fn cyclic_subscribe_payload(time_base: u8, factor: u8, tags: &[S7Tag]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + tags.len() * 12);
    body.put_u16(tags.len() as u16);
    body.put_u8(time_base);
    body.put_u8(factor);
    for tag in tags {
        tag.encode_any_item(&mut body);
    }
    let mut d = BytesMut::new();
    DataItem::ok(DataTransportSize::OctetString, body.freeze()).encode_to(&mut d, true);
    d.freeze()
}

pub fn cyclic_unsubscribe_payload(job_id: u8) -> Bytes {
    let mut d = BytesMut::new();
    DataItem::ok(
        DataTransportSize::OctetString,
        Bytes::copy_from_slice(&[0x01, job_id]),
    )
    .encode_to(&mut d, true);
    d.freeze()
}

/// Whether a CPU-function subfunction is an alarm/notify indication.
#[inline]
pub fn is_alarm_subfunction(sub: u8) -> bool {
    subfunction::ALARMS.contains(&sub)
}
