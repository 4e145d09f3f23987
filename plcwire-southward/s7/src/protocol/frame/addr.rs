use super::{
    super::error::{Error, Result},
    types::{DataTransportSize, S7Area, S7TransportSize},
};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Syntax id of an S7ANY item address
const SYNTAX_S7ANY: u8 = 0x10;

/// Element data type of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum S7DataType {
    Bool,
    Byte,
    Word,
    DWord,
    Char,
    Int,
    DInt,
    UInt,
    UDInt,
    Real,
    LReal,
    /// STRING with its declared maximum length
    String(u8),
    Date,
    TimeOfDay,
    Time,
    DateAndTime,
}

impl S7DataType {
    /// Bytes one element occupies in PLC memory.
    pub fn element_len(self) -> usize {
        match self {
            S7DataType::Bool | S7DataType::Byte | S7DataType::Char => 1,
            S7DataType::Word | S7DataType::Int | S7DataType::UInt | S7DataType::Date => 2,
            S7DataType::DWord
            | S7DataType::DInt
            | S7DataType::UDInt
            | S7DataType::Real
            | S7DataType::TimeOfDay
            | S7DataType::Time => 4,
            S7DataType::LReal | S7DataType::DateAndTime => 8,
            S7DataType::String(max) => max as usize + 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            S7DataType::Bool => "BOOL",
            S7DataType::Byte => "BYTE",
            S7DataType::Word => "WORD",
            S7DataType::DWord => "DWORD",
            S7DataType::Char => "CHAR",
            S7DataType::Int => "INT",
            S7DataType::DInt => "DINT",
            S7DataType::UInt => "UINT",
            S7DataType::UDInt => "UDINT",
            S7DataType::Real => "REAL",
            S7DataType::LReal => "LREAL",
            S7DataType::String(_) => "STRING",
            S7DataType::Date => "DATE",
            S7DataType::TimeOfDay => "TIME_OF_DAY",
            S7DataType::Time => "TIME",
            S7DataType::DateAndTime => "DATE_AND_TIME",
        }
    }

    fn parse_name(s: &str) -> Result<Self> {
        if let Some(inner) = s
            .strip_prefix("STRING(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let max = inner
                .parse::<u8>()
                .ok()
                .filter(|m| *m > 0 && *m <= 254)
                .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
            return Ok(S7DataType::String(max));
        }
        Ok(match s {
            "BOOL" => S7DataType::Bool,
            "BYTE" | "USINT" | "SINT" => S7DataType::Byte,
            "WORD" => S7DataType::Word,
            "DWORD" => S7DataType::DWord,
            "CHAR" => S7DataType::Char,
            "INT" => S7DataType::Int,
            "DINT" => S7DataType::DInt,
            "UINT" => S7DataType::UInt,
            "UDINT" => S7DataType::UDInt,
            "REAL" => S7DataType::Real,
            "LREAL" => S7DataType::LReal,
            "STRING" => S7DataType::String(254),
            "DATE" => S7DataType::Date,
            "TIME_OF_DAY" | "TOD" => S7DataType::TimeOfDay,
            "TIME" => S7DataType::Time,
            "DATE_AND_TIME" | "DT" => S7DataType::DateAndTime,
            other => return Err(Error::InvalidAddress(format!("unknown data type {other}"))),
        })
    }
}

/// Parsed tag: where it lives and how to interpret it.
///
/// Text form: `%DB<n>.DB<X|B|W|D><byte>[.<bit>]:<TYPE>[<count>]` for data
/// blocks, `%<area>[X|B|W|D]<byte>[.<bit>]:<TYPE>[<count>]` for I/Q/M/L/P.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S7Tag {
    pub area: S7Area,
    pub db_number: u16,
    pub byte_offset: u32,
    pub bit_offset: u8,
    pub data_type: S7DataType,
    pub count: u16,
}

impl S7Tag {
    /// Total bytes the tag covers on the wire.
    pub fn byte_len(&self) -> usize {
        self.data_type.element_len() * self.count as usize
    }

    /// Wire transport used when reading or writing this tag.
    ///
    /// Bits are addressed individually; everything else is moved as raw
    /// bytes and interpreted locally.
    pub fn transport_size(&self) -> S7TransportSize {
        match self.data_type {
            S7DataType::Bool => S7TransportSize::Bit,
            _ => S7TransportSize::Byte,
        }
    }

    pub fn data_transport_size(&self) -> DataTransportSize {
        match self.data_type {
            S7DataType::Bool => DataTransportSize::Bit,
            _ => DataTransportSize::ByteWordDWord,
        }
    }

    /// Number of transport units requested in the S7ANY item.
    pub fn transport_count(&self) -> u16 {
        match self.data_type {
            S7DataType::Bool => self.count,
            _ => self.byte_len() as u16,
        }
    }

    /// Writes the 12-byte S7ANY item address.
    pub fn encode_any_item<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(0x12);
        dst.put_u8(0x0A);
        dst.put_u8(SYNTAX_S7ANY);
        dst.put_u8(self.transport_size() as u8);
        dst.put_u16(self.transport_count());
        dst.put_u16(self.db_number);
        dst.put_u8(self.area as u8);
        let address = (self.byte_offset << 3) | (self.bit_offset as u32 & 0x07);
        dst.put_u8(((address >> 16) & 0xFF) as u8);
        dst.put_u16((address & 0xFFFF) as u16);
    }
}

impl FromStr for S7Tag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_tag(s)
    }
}

impl fmt::Display for S7Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match self.data_type {
            S7DataType::Bool => 'X',
            t if t.element_len() == 2 => 'W',
            t if t.element_len() == 4 => 'D',
            _ => 'B',
        };
        match self.area {
            S7Area::DataBlocks => write!(f, "%DB{}.DB{}{}", self.db_number, size, self.byte_offset)?,
            area => write!(f, "%{}{}{}", area_letter(area), size, self.byte_offset)?,
        }
        if self.data_type == S7DataType::Bool {
            write!(f, ".{}", self.bit_offset)?;
        }
        match self.data_type {
            S7DataType::String(max) if max != 254 => write!(f, ":STRING({max})")?,
            t => write!(f, ":{}", t.name())?,
        }
        if self.count > 1 {
            write!(f, "[{}]", self.count)?;
        }
        Ok(())
    }
}

fn area_letter(area: S7Area) -> &'static str {
    match area {
        S7Area::Inputs => "I",
        S7Area::Outputs => "Q",
        S7Area::Flags => "M",
        S7Area::LocalData => "L",
        S7Area::PeripheralIo => "P",
        S7Area::InstanceDataBlocks => "DI",
        S7Area::Counters => "C",
        S7Area::Timers => "T",
        S7Area::DataBlocks => "DB",
    }
}

fn invalid(input: &str) -> Error {
    Error::InvalidAddress(input.to_string())
}

/// Parse the textual tag form into an [`S7Tag`].
pub fn parse_tag(input: &str) -> Result<S7Tag> {
    let upper = input.trim().to_ascii_uppercase();
    let s = upper.strip_prefix('%').unwrap_or(&upper);

    let (location, type_part) = s.split_once(':').ok_or_else(|| invalid(input))?;
    let (type_name, count) = match type_part.split_once('[') {
        Some((name, rest)) => {
            let n = rest
                .strip_suffix(']')
                .and_then(|n| n.parse::<u16>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| invalid(input))?;
            (name, n)
        }
        None => (type_part, 1),
    };
    let data_type = S7DataType::parse_name(type_name)?;

    let (area, db_number, offset) = if let Some(rest) = location.strip_prefix("DB") {
        let (db, offset) = rest.split_once('.').ok_or_else(|| invalid(input))?;
        let db = db.parse::<u16>().map_err(|_| invalid(input))?;
        let offset = offset.strip_prefix("DB").ok_or_else(|| invalid(input))?;
        (S7Area::DataBlocks, db, offset)
    } else {
        let mut chars = location.chars();
        let area = match chars.next() {
            Some('I') | Some('E') => S7Area::Inputs,
            Some('Q') | Some('A') => S7Area::Outputs,
            Some('M') => S7Area::Flags,
            Some('L') => S7Area::LocalData,
            Some('P') => S7Area::PeripheralIo,
            _ => return Err(invalid(input)),
        };
        (area, 0u16, chars.as_str())
    };

    let offset = offset
        .strip_prefix(['X', 'B', 'W', 'D'])
        .unwrap_or(offset);
    let (byte_s, bit_s) = match offset.split_once('.') {
        Some((b, bit)) => (b, Some(bit)),
        None => (offset, None),
    };
    let byte_offset = byte_s
        .parse::<u32>()
        .ok()
        .filter(|b| *b <= 0x1F_FFFF)
        .ok_or_else(|| invalid(input))?;
    let bit_offset = match (data_type, bit_s) {
        (S7DataType::Bool, Some(bit)) => bit
            .parse::<u8>()
            .ok()
            .filter(|b| *b <= 7)
            .ok_or_else(|| invalid(input))?,
        (S7DataType::Bool, None) => 0,
        (_, Some(_)) => return Err(invalid(input)),
        (_, None) => 0,
    };
    if data_type == S7DataType::Bool && count != 1 {
        return Err(Error::InvalidAddress(format!(
            "{input}: bit tags address a single element"
        )));
    }

    Ok(S7Tag {
        area,
        db_number,
        byte_offset,
        bit_offset,
        data_type,
        count,
    })
}
