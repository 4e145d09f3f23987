use super::super::frame::{
    decode_tag_value,
    message::{is_alarm_subfunction, parse_data_items},
    types::subfunction,
    CpuFunctionGroup, CpuFunctionType, DataItem, DataTransportSize, S7DataValue, S7Pdu,
    S7ReturnCode, S7Tag, UserDataParam,
};
use crate::types::EventCategory;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// User diagnostic event ids occupy this range; everything else is a system entry.
pub const USER_EVENT_IDS: std::ops::RangeInclusive<u16> = 0xA000..=0xBFFF;

/// CPU operating mode reported by a mode-transition push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CpuMode {
    Stop,
    WarmRestart,
    Run,
    HotRestart,
    Hold,
    ColdRestart,
    RunRedundant,
    LinkUp,
    Update,
    Unknown(u8),
}

impl From<u8> for CpuMode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => CpuMode::Stop,
            0x01 => CpuMode::WarmRestart,
            0x02 => CpuMode::Run,
            0x03 => CpuMode::HotRestart,
            0x04 => CpuMode::Hold,
            0x06 => CpuMode::ColdRestart,
            0x09 => CpuMode::RunRedundant,
            0x11 => CpuMode::LinkUp,
            0x12 => CpuMode::Update,
            other => CpuMode::Unknown(other),
        }
    }
}

/// One diagnostic buffer entry (system or user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticEntry {
    pub event_id: u16,
    pub priority: u8,
    pub ob_number: u8,
    pub dat_id: u16,
    pub info1: u16,
    pub info2: u32,
    /// Device-side timestamp, if the BCD field was valid
    pub timestamp: Option<NaiveDateTime>,
}

impl DiagnosticEntry {
    #[inline]
    pub fn is_user(&self) -> bool {
        USER_EVENT_IDS.contains(&self.event_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmObject {
    pub event_id: u32,
    pub event_state: u8,
    pub ack_state_going: u8,
    pub ack_state_coming: u8,
    /// Raw associated values in transmission order
    #[serde(skip)]
    pub associated_values: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmIndication {
    pub subfunction: u8,
    pub timestamp: Option<NaiveDateTime>,
    pub objects: Vec<AlarmObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CyclicItem {
    /// Subscribed tag, when the job is known locally
    pub tag: Option<String>,
    #[serde(skip)]
    pub return_code: S7ReturnCode,
    #[serde(skip)]
    pub raw: Bytes,
    #[serde(skip)]
    pub value: Option<S7DataValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CyclicData {
    pub job_id: u8,
    pub items: Vec<CyclicItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventDetails {
    Mode { mode: CpuMode },
    Diagnostic(DiagnosticEntry),
    Alarm(AlarmIndication),
    Cyclic(CyclicData),
}

/// A classified unsolicited message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct S7Event {
    pub category: EventCategory,
    pub received_at: DateTime<Utc>,
    pub details: EventDetails,
}

/// Unclassified push as captured by the read path.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub pdu: S7Pdu,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn now(pdu: S7Pdu) -> Self {
        Self {
            pdu,
            received_at: Utc::now(),
        }
    }
}

/// Whether a user-data PDU is an unsolicited push rather than a response.
pub fn is_push(pdu: &S7Pdu) -> bool {
    UserDataParam::parse(&pdu.param)
        .map(|p| p.kind == CpuFunctionType::Push)
        .unwrap_or(false)
}

fn bcd(b: u8) -> u32 {
    ((b >> 4) as u32) * 10 + (b & 0x0F) as u32
}

/// 8-byte BCD DATE_AND_TIME; years 90..99 are 19xx.
fn bcd_timestamp(b: &[u8]) -> Option<NaiveDateTime> {
    let b = b.get(..8)?;
    let yy = bcd(b[0]) as i32;
    let year = if yy >= 90 { 1900 + yy } else { 2000 + yy };
    let millis = bcd(b[6]) * 10 + (b[7] >> 4) as u32;
    NaiveDate::from_ymd_opt(year, bcd(b[1]), bcd(b[2]))?.and_hms_milli_opt(
        bcd(b[3]),
        bcd(b[4]),
        bcd(b[5]),
        millis,
    )
}

fn be16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*b.get(at)?, *b.get(at + 1)?]))
}

fn be32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *b.get(at)?,
        *b.get(at + 1)?,
        *b.get(at + 2)?,
        *b.get(at + 3)?,
    ]))
}

/// First data item of a user-data payload; pushes carry exactly one.
fn first_item(payload: &Bytes) -> Option<DataItem> {
    parse_data_items(payload).ok()?.into_iter().next()
}

fn parse_diagnostic(data: &[u8]) -> Option<DiagnosticEntry> {
    Some(DiagnosticEntry {
        event_id: be16(data, 0)?,
        priority: *data.get(2)?,
        ob_number: *data.get(3)?,
        dat_id: be16(data, 4)?,
        info1: be16(data, 6)?,
        info2: be32(data, 8)?,
        timestamp: data.get(12..20).and_then(bcd_timestamp),
    })
}

fn parse_alarm(subfunction: u8, data: &Bytes) -> AlarmIndication {
    let mut objects = Vec::new();
    let timestamp = data.get(..8).and_then(bcd_timestamp);
    // timestamp(8) function id(1) object count(1)
    let count = data.get(9).copied().unwrap_or(0);
    let mut at = 10;
    for _ in 0..count {
        // variable spec(1) length(1) syntax id(1) value count(1)
        let Some(values) = data.get(at + 3).copied() else { break };
        let (Some(event_id), Some(states)) = (be32(data, at + 4), data.get(at + 8..at + 12)) else {
            break;
        };
        at += 12;
        let mut associated_values = Vec::with_capacity(values as usize);
        for _ in 0..values {
            let (Some(transport), Some(len)) = (data.get(at + 1).copied(), be16(data, at + 2)) else {
                break;
            };
            let byte_len = match DataTransportSize::try_from(transport) {
                Ok(DataTransportSize::Bit) => len as usize,
                Ok(t) if t.length_in_bits() => (len as usize).div_ceil(8),
                _ => len as usize,
            };
            let start = at + 4;
            let Some(value) = data.get(start..start + byte_len) else { break };
            associated_values.push(data.slice_ref(value));
            at = start + byte_len + (byte_len % 2);
        }
        objects.push(AlarmObject {
            event_id,
            event_state: states[0],
            ack_state_going: states[2],
            ack_state_coming: states[3],
            associated_values,
        });
    }
    AlarmIndication {
        subfunction,
        timestamp,
        objects,
    }
}

fn parse_cyclic(job_id: u8, data: &Bytes, tags: Option<&Vec<S7Tag>>) -> CyclicData {
    let items = data
        .get(2..)
        .map(|rest| data.slice_ref(rest))
        .and_then(|rest| parse_data_items(&rest).ok())
        .unwrap_or_default();
    let items = items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let tag = tags.and_then(|t| t.get(idx));
            let value = match (tag, item.return_code) {
                (Some(tag), S7ReturnCode::Success) => decode_tag_value(tag, &item.data).ok(),
                _ => None,
            };
            CyclicItem {
                tag: tag.map(|t| t.to_string()),
                return_code: item.return_code,
                raw: item.data,
                value,
            }
        })
        .collect();
    CyclicData { job_id, items }
}

/// Maps a pushed user-data PDU onto an event category.
///
/// `cyclic_jobs` resolves a cyclic job id to the tags it was opened with so
/// samples can be decoded into typed values.
pub fn classify(raw: &RawEvent, cyclic_jobs: &HashMap<u8, Vec<S7Tag>>) -> Option<S7Event> {
    let param = UserDataParam::parse(&raw.pdu.param).ok()?;
    let group = CpuFunctionGroup::try_from(param.group).ok()?;
    let (category, details) = match (group, param.subfunction) {
        (CpuFunctionGroup::ModeTransition, mode) => (
            EventCategory::Mode,
            EventDetails::Mode {
                mode: CpuMode::from(mode),
            },
        ),
        (CpuFunctionGroup::CpuFunctions, subfunction::DIAGNOSTIC_MESSAGE) => {
            let item = first_item(&raw.pdu.payload)?;
            let entry = parse_diagnostic(&item.data)?;
            let category = if entry.is_user() {
                EventCategory::UserDiagnostic
            } else {
                EventCategory::SystemDiagnostic
            };
            (category, EventDetails::Diagnostic(entry))
        }
        (CpuFunctionGroup::CpuFunctions, sub) if is_alarm_subfunction(sub) => {
            let item = first_item(&raw.pdu.payload)?;
            (EventCategory::Alarm, EventDetails::Alarm(parse_alarm(sub, &item.data)))
        }
        (CpuFunctionGroup::CyclicServices, subfunction::CYCLIC_TRANSFER) => {
            let item = first_item(&raw.pdu.payload)?;
            let tags = cyclic_jobs.get(&param.sequence);
            (
                EventCategory::Cyclic,
                EventDetails::Cyclic(parse_cyclic(param.sequence, &item.data, tags)),
            )
        }
        _ => return None,
    };
    Some(S7Event {
        category,
        received_at: raw.received_at,
        details,
    })
}
