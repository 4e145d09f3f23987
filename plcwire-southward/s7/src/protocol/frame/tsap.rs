use super::super::error::{Error, Result};
use crate::types::ControllerType;
use std::str::FromStr;

/// Calling (local) and called (remote) transport service access points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsapPair {
    pub local: u16,
    pub remote: u16,
}

fn parse_tsap(s: &str) -> Result<u16> {
    let s = s.trim();
    let invalid = || Error::InvalidAddress(format!("invalid TSAP {s}"));
    if let Some((h, l)) = s.split_once(':') {
        let high = u8::from_str_radix(h.trim(), 16).map_err(|_| invalid())?;
        let low = u8::from_str_radix(l.trim(), 16).map_err(|_| invalid())?;
        return Ok(u16::from_be_bytes([high, low]));
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u16::from_str_radix(hex, 16).map_err(|_| invalid());
    }
    s.parse::<u16>().map_err(|_| invalid())
}

impl FromStr for TsapPair {
    type Err = Error;

    /// `local/remote`, each as `HH:LL`, `0xHHLL` or decimal.
    fn from_str(s: &str) -> Result<Self> {
        let (l, r) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(format!("invalid TSAP pair {s}")))?;
        Ok(TsapPair {
            local: parse_tsap(l)?,
            remote: parse_tsap(r)?,
        })
    }
}

impl TsapPair {
    /// Conventional TSAPs for a PG/PC talking to the CPU in `rack`/`slot`.
    pub fn for_controller(controller: ControllerType, rack: u8, slot: u8) -> Result<Self> {
        if rack > 0x07 {
            return Err(Error::InvalidAddress(format!("rack {rack} out of range 0..=7")));
        }
        if slot > 0x1F {
            return Err(Error::InvalidAddress(format!("slot {slot} out of range 0..=31")));
        }
        Ok(match controller {
            ControllerType::S7_200 => TsapPair {
                local: 0x1000,
                remote: 0x1001,
            },
            ControllerType::Logo => TsapPair {
                local: 0x0100,
                remote: 0x0102,
            },
            _ => TsapPair {
                local: 0x0100,
                remote: u16::from_be_bytes([0x03, (rack << 5) | slot]),
            },
        })
    }
}
