pub mod addr;
pub mod cotp;
pub mod header;
pub mod message;
mod pdu;
pub mod tpkt;
pub mod tsap;
pub mod types;
pub mod value;

use bytes::Bytes;
pub use plcwire_sdk::{WireDecode, WireEncode};

/// Application body carried by a COTP data TPDU.
#[derive(Debug, Clone)]
pub enum S7AppBody {
    /// Fragment (EOT not set) or bytes that did not parse as an S7 PDU
    Segmented(Bytes),
    /// Complete S7 PDU
    Parsed(S7Pdu),
}

/// One decoded TPKT frame.
#[derive(Debug, Clone)]
pub struct S7Message {
    pub tpkt: Tpkt,
    pub cotp: Cotp,
    /// Present only for data TPDUs
    pub app: Option<S7AppBody>,
}

impl S7Message {
    /// Wrap a PDU in a single data TPDU.
    pub fn data(pdu: S7Pdu) -> Self {
        let cotp = Cotp::data();
        let len = cotp.encoded_len(&()) + pdu.encoded_len(&());
        Self {
            tpkt: Tpkt::for_payload(len),
            cotp,
            app: Some(S7AppBody::Parsed(pdu)),
        }
    }

    /// A control TPDU without application data (CR, CC, DR, DC).
    pub fn control(cotp: Cotp) -> Self {
        Self {
            tpkt: Tpkt::for_payload(cotp.encoded_len(&())),
            cotp,
            app: None,
        }
    }

    pub fn pdu(&self) -> Option<&S7Pdu> {
        match &self.app {
            Some(S7AppBody::Parsed(pdu)) => Some(pdu),
            _ => None,
        }
    }

    pub fn into_pdu(self) -> Option<S7Pdu> {
        match self.app {
            Some(S7AppBody::Parsed(pdu)) => Some(pdu),
            _ => None,
        }
    }
}

pub use addr::{parse_tag, S7DataType, S7Tag};
pub use cotp::{tpdu_size_code_for, ConnectionParams, Cotp};
pub use header::{HeaderError, S7Header};
pub use message::{DataItem, SetupCommunication, UserDataParam};
pub use pdu::S7Pdu;
pub use tpkt::Tpkt;
pub use tsap::TsapPair;
pub use types::{
    CpuFunctionGroup, CpuFunctionType, DataTransportSize, S7Area, S7Function, S7PduType,
    S7ReturnCode, S7TransportSize,
};
pub use value::{decode_tag_value, encode_tag_value, S7DataValue};
