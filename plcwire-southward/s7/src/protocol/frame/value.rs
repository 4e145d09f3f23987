use super::{
    super::error::{Error, Result},
    addr::{S7DataType, S7Tag},
};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Typed value read from or written to a tag
#[derive(Debug, Clone, PartialEq)]
pub enum S7DataValue {
    Bool(bool),
    Byte(u8),
    Word(u16),
    DWord(u32),
    /// Latin-1 character
    Char(char),
    Int(i16),
    DInt(i32),
    UInt(u16),
    UDInt(u32),
    Real(f32),
    LReal(f64),
    /// Latin-1 string
    String(String),
    /// Days since 1990-01-01 on the wire
    Date(NaiveDate),
    /// Milliseconds since midnight on the wire
    TimeOfDay(NaiveTime),
    /// Signed milliseconds on the wire
    Time(Duration),
    /// 8-byte BCD DATE_AND_TIME
    DateTime(NaiveDateTime),
    /// Array tag (`count > 1`)
    List(Vec<S7DataValue>),
}

fn mismatch(ty: S7DataType) -> Error {
    Error::ValueTypeMismatch {
        expected: ty.name(),
    }
}

fn date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default()
}

#[inline]
fn bcd(v: u32) -> u8 {
    (((v / 10) % 10) << 4 | (v % 10)) as u8
}

#[inline]
fn from_bcd(b: u8) -> u32 {
    ((b >> 4) as u32) * 10 + (b & 0x0F) as u32
}

impl S7DataValue {
    /// Encode a single element of `ty`.
    pub fn encode_element<B: BufMut>(&self, ty: S7DataType, dst: &mut B) -> Result<()> {
        match (ty, self) {
            (S7DataType::Bool, S7DataValue::Bool(v)) => dst.put_u8(*v as u8),
            (S7DataType::Byte, S7DataValue::Byte(v)) => dst.put_u8(*v),
            (S7DataType::Word, S7DataValue::Word(v)) => dst.put_u16(*v),
            (S7DataType::DWord, S7DataValue::DWord(v)) => dst.put_u32(*v),
            (S7DataType::Char, S7DataValue::Char(c)) => {
                let b = u8::try_from(*c as u32).map_err(|_| mismatch(ty))?;
                dst.put_u8(b)
            }
            (S7DataType::Int, S7DataValue::Int(v)) => dst.put_i16(*v),
            (S7DataType::DInt, S7DataValue::DInt(v)) => dst.put_i32(*v),
            (S7DataType::UInt, S7DataValue::UInt(v)) => dst.put_u16(*v),
            (S7DataType::UDInt, S7DataValue::UDInt(v)) => dst.put_u32(*v),
            (S7DataType::Real, S7DataValue::Real(v)) => dst.put_f32(*v),
            (S7DataType::LReal, S7DataValue::LReal(v)) => dst.put_f64(*v),
            (S7DataType::String(max), S7DataValue::String(s)) => {
                let latin1: Vec<u8> = s
                    .chars()
                    .map(|c| u8::try_from(c as u32).map_err(|_| mismatch(ty)))
                    .collect::<Result<_>>()?;
                if latin1.len() > max as usize {
                    return Err(mismatch(ty));
                }
                dst.put_u8(max);
                dst.put_u8(latin1.len() as u8);
                dst.put_slice(&latin1);
                dst.put_bytes(0, max as usize - latin1.len());
            }
            (S7DataType::Date, S7DataValue::Date(d)) => {
                let days = (*d - date_epoch()).num_days();
                let days = u16::try_from(days).map_err(|_| mismatch(ty))?;
                dst.put_u16(days)
            }
            (S7DataType::TimeOfDay, S7DataValue::TimeOfDay(t)) => {
                let ms = t.num_seconds_from_midnight() * 1000 + t.nanosecond() / 1_000_000;
                dst.put_u32(ms)
            }
            (S7DataType::Time, S7DataValue::Time(d)) => {
                let ms = i32::try_from(d.num_milliseconds()).map_err(|_| mismatch(ty))?;
                dst.put_i32(ms)
            }
            (S7DataType::DateAndTime, S7DataValue::DateTime(dt)) => {
                let year = dt.year();
                if !(1990..=2089).contains(&year) {
                    return Err(mismatch(ty));
                }
                let millis = dt.nanosecond() / 1_000_000;
                dst.put_u8(bcd((year % 100) as u32));
                dst.put_u8(bcd(dt.month()));
                dst.put_u8(bcd(dt.day()));
                dst.put_u8(bcd(dt.hour()));
                dst.put_u8(bcd(dt.minute()));
                dst.put_u8(bcd(dt.second()));
                dst.put_u8(bcd(millis / 10));
                // Low nibble: weekday, 1 = Sunday.
                let weekday = dt.weekday().number_from_sunday() as u8;
                dst.put_u8((((millis % 10) as u8) << 4) | weekday);
            }
            _ => return Err(mismatch(ty)),
        }
        Ok(())
    }

    /// Decode a single element of `ty` from exactly `ty.element_len()` bytes.
    pub fn decode_element(ty: S7DataType, b: &[u8]) -> Result<Self> {
        if b.len() < ty.element_len() {
            return Err(Error::InsufficientData {
                needed: ty.element_len(),
                available: b.len(),
            });
        }
        let u16_at = |i: usize| u16::from_be_bytes([b[i], b[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        Ok(match ty {
            S7DataType::Bool => S7DataValue::Bool(b[0] & 0x01 != 0),
            S7DataType::Byte => S7DataValue::Byte(b[0]),
            S7DataType::Char => S7DataValue::Char(b[0] as char),
            S7DataType::Word => S7DataValue::Word(u16_at(0)),
            S7DataType::Int => S7DataValue::Int(u16_at(0) as i16),
            S7DataType::UInt => S7DataValue::UInt(u16_at(0)),
            S7DataType::DWord => S7DataValue::DWord(u32_at(0)),
            S7DataType::DInt => S7DataValue::DInt(u32_at(0) as i32),
            S7DataType::UDInt => S7DataValue::UDInt(u32_at(0)),
            S7DataType::Real => S7DataValue::Real(f32::from_bits(u32_at(0))),
            S7DataType::LReal => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&b[..8]);
                S7DataValue::LReal(f64::from_be_bytes(raw))
            }
            S7DataType::String(max) => {
                let len = (b[1] as usize).min(max as usize);
                S7DataValue::String(b[2..2 + len].iter().map(|&c| c as char).collect())
            }
            S7DataType::Date => {
                let date = date_epoch()
                    .checked_add_signed(Duration::days(u16_at(0) as i64))
                    .ok_or(mismatch(ty))?;
                S7DataValue::Date(date)
            }
            S7DataType::TimeOfDay => {
                let ms = u32_at(0);
                let t = NaiveTime::from_num_seconds_from_midnight_opt(
                    ms / 1000,
                    (ms % 1000) * 1_000_000,
                )
                .ok_or(mismatch(ty))?;
                S7DataValue::TimeOfDay(t)
            }
            S7DataType::Time => S7DataValue::Time(Duration::milliseconds(u32_at(0) as i32 as i64)),
            S7DataType::DateAndTime => {
                let yy = from_bcd(b[0]) as i32;
                let year = if yy >= 90 { 1900 + yy } else { 2000 + yy };
                let millis = from_bcd(b[6]) * 10 + (b[7] >> 4) as u32;
                let dt = NaiveDate::from_ymd_opt(year, from_bcd(b[1]), from_bcd(b[2]))
                    .and_then(|d| {
                        d.and_hms_milli_opt(from_bcd(b[3]), from_bcd(b[4]), from_bcd(b[5]), millis)
                    })
                    .ok_or(mismatch(ty))?;
                S7DataValue::DateTime(dt)
            }
        })
    }
}

/// Encode a write value for `tag`. Array tags take a `List` of exactly `count` elements.
pub fn encode_tag_value(tag: &S7Tag, value: &S7DataValue) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(tag.byte_len());
    match (tag.count, value) {
        (1, S7DataValue::List(items)) if items.len() == 1 => {
            items[0].encode_element(tag.data_type, &mut buf)?
        }
        (1, v) => v.encode_element(tag.data_type, &mut buf)?,
        (n, S7DataValue::List(items)) if items.len() == n as usize => {
            for item in items {
                item.encode_element(tag.data_type, &mut buf)?;
            }
        }
        _ => return Err(mismatch(tag.data_type)),
    }
    Ok(buf.freeze())
}

/// Decode the raw bytes returned for `tag`.
pub fn decode_tag_value(tag: &S7Tag, data: &[u8]) -> Result<S7DataValue> {
    let len = tag.data_type.element_len();
    if tag.count == 1 {
        return S7DataValue::decode_element(tag.data_type, data);
    }
    if data.len() < len * tag.count as usize {
        return Err(Error::InsufficientData {
            needed: len * tag.count as usize,
            available: data.len(),
        });
    }
    data.chunks_exact(len)
        .take(tag.count as usize)
        .map(|chunk| S7DataValue::decode_element(tag.data_type, chunk))
        .collect::<Result<Vec<_>>>()
        .map(S7DataValue::List)
}

#[cfg(test)]
mod tests {
    use super::super::addr::parse_tag;
    use super::*;

    fn round_trip(tag: &str, value: S7DataValue) {
        let tag = parse_tag(tag).unwrap();
        let bytes = encode_tag_value(&tag, &value).unwrap();
        assert_eq!(bytes.len(), tag.byte_len(), "{tag}");
        assert_eq!(decode_tag_value(&tag, &bytes).unwrap(), value, "{tag}");
    }

    #[test]
    fn every_writable_type_round_trips() {
        round_trip("%MX0.1:BOOL", S7DataValue::Bool(true));
        round_trip("%MB0:BYTE", S7DataValue::Byte(0xA5));
        round_trip("%DB1.DBW0:WORD", S7DataValue::Word(0xBEEF));
        round_trip("%DB1.DBD0:DWORD", S7DataValue::DWord(0xDEAD_BEEF));
        round_trip("%DB1.DBB0:CHAR", S7DataValue::Char('é'));
        round_trip("%DB1.DBW0:INT", S7DataValue::Int(-1234));
        round_trip("%DB1.DBD0:DINT", S7DataValue::DInt(-7_000_000));
        round_trip("%DB1.DBW0:UINT", S7DataValue::UInt(65_000));
        round_trip("%DB1.DBD0:UDINT", S7DataValue::UDInt(4_000_000_000));
        round_trip("%DB1.DBD0:REAL", S7DataValue::Real(3.25));
        round_trip("%DB1.DB0:LREAL", S7DataValue::LReal(-1.0e-9));
        round_trip("%DB1.DBB0:STRING(10)", S7DataValue::String("pump-7".into()));
        round_trip(
            "%DB1.DBW0:DATE",
            S7DataValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
        );
        round_trip(
            "%DB1.DBD0:TIME_OF_DAY",
            S7DataValue::TimeOfDay(NaiveTime::from_hms_milli_opt(23, 59, 58, 125).unwrap()),
        );
        round_trip("%DB1.DBD0:TIME", S7DataValue::Time(Duration::milliseconds(-90_500)));
        round_trip(
            "%DB1.DB0:DATE_AND_TIME",
            S7DataValue::DateTime(
                NaiveDate::from_ymd_opt(2031, 12, 24)
                    .unwrap()
                    .and_hms_milli_opt(18, 30, 5, 987)
                    .unwrap(),
            ),
        );
        round_trip(
            "%DB1.DBW0:INT[3]",
            S7DataValue::List(vec![
                S7DataValue::Int(1),
                S7DataValue::Int(-2),
                S7DataValue::Int(3),
            ]),
        );
    }

    #[test]
    fn date_and_time_wire_layout() {
        let tag = parse_tag("%DB1.DB0:DT").unwrap();
        let v = S7DataValue::DateTime(
            NaiveDate::from_ymd_opt(1999, 8, 1)
                .unwrap()
                .and_hms_milli_opt(12, 0, 0, 123)
                .unwrap(),
        );
        let bytes = encode_tag_value(&tag, &v).unwrap();
        // 1999-08-01 is a Sunday.
        assert_eq!(&bytes[..], &[0x99, 0x08, 0x01, 0x12, 0x00, 0x00, 0x12, 0x31]);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let tag = parse_tag("%DB1.DBW0:INT").unwrap();
        assert!(encode_tag_value(&tag, &S7DataValue::Real(1.0)).is_err());
        let tag = parse_tag("%DB1.DBB0:STRING(3)").unwrap();
        assert!(encode_tag_value(&tag, &S7DataValue::String("toolong".into())).is_err());
        let tag = parse_tag("%DB1.DBW0:INT[2]").unwrap();
        assert!(encode_tag_value(&tag, &S7DataValue::Int(1)).is_err());
    }
}
