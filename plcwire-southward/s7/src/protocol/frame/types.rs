//! Protocol constants. Each enum is a closed lookup table from wire byte to
//! variant; unknown bytes are rejected at the parse site.

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CotpType {
    Cr = 0xE0,
    Cc = 0xD0,
    Dr = 0x80,
    Dc = 0xC0,
    D = 0xF0,
}

impl TryFrom<u8> for CotpType {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0xE0 => Ok(CotpType::Cr),
            0xD0 => Ok(CotpType::Cc),
            0x80 => Ok(CotpType::Dr),
            0xC0 => Ok(CotpType::Dc),
            0xF0 => Ok(CotpType::D),
            _ => Err(()),
        }
    }
}

/// S7 ROSCTR
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7PduType {
    Job = 0x01,
    Ack = 0x02,
    AckData = 0x03,
    UserData = 0x07,
}

impl S7PduType {
    /// Ack and AckData carry two extra header bytes (error class + code).
    #[inline]
    pub fn has_error_field(self) -> bool {
        matches!(self, S7PduType::Ack | S7PduType::AckData)
    }
}

impl TryFrom<u8> for S7PduType {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x01 => Ok(S7PduType::Job),
            0x02 => Ok(S7PduType::Ack),
            0x03 => Ok(S7PduType::AckData),
            0x07 => Ok(S7PduType::UserData),
            _ => Err(()),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Function {
    ReadVar = 0x04,
    WriteVar = 0x05,
    SetupCommunication = 0xF0,
}

impl TryFrom<u8> for S7Function {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x04 => Ok(S7Function::ReadVar),
            0x05 => Ok(S7Function::WriteVar),
            0xF0 => Ok(S7Function::SetupCommunication),
            _ => Err(()),
        }
    }
}

/// Memory areas addressable through S7ANY
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S7Area {
    PeripheralIo = 0x80,
    Inputs = 0x81,
    Outputs = 0x82,
    Flags = 0x83,
    DataBlocks = 0x84,
    InstanceDataBlocks = 0x85,
    LocalData = 0x86,
    Counters = 0x1C,
    Timers = 0x1D,
}

impl TryFrom<u8> for S7Area {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x80 => Ok(S7Area::PeripheralIo),
            0x81 => Ok(S7Area::Inputs),
            0x82 => Ok(S7Area::Outputs),
            0x83 => Ok(S7Area::Flags),
            0x84 => Ok(S7Area::DataBlocks),
            0x85 => Ok(S7Area::InstanceDataBlocks),
            0x86 => Ok(S7Area::LocalData),
            0x1C => Ok(S7Area::Counters),
            0x1D => Ok(S7Area::Timers),
            _ => Err(()),
        }
    }
}

/// Transport size used inside an S7ANY item address
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7TransportSize {
    Bit = 0x01,
    Byte = 0x02,
    Char = 0x03,
    Word = 0x04,
    Int = 0x05,
    DWord = 0x06,
    DInt = 0x07,
    Real = 0x08,
    Date = 0x09,
    TimeOfDay = 0x0A,
    Time = 0x0B,
    DateTime = 0x0F,
}

/// Transport size used in the data section of a read response / write request
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransportSize {
    Null = 0x00,
    Bit = 0x03,
    ByteWordDWord = 0x04,
    Integer = 0x05,
    Real = 0x07,
    OctetString = 0x09,
}

impl DataTransportSize {
    /// Whether the item length field counts bits rather than bytes.
    #[inline]
    pub fn length_in_bits(self) -> bool {
        matches!(
            self,
            DataTransportSize::Bit | DataTransportSize::ByteWordDWord | DataTransportSize::Integer
        )
    }
}

impl TryFrom<u8> for DataTransportSize {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match v {
            0x00 => DataTransportSize::Null,
            0x03 => DataTransportSize::Bit,
            0x04 => DataTransportSize::ByteWordDWord,
            0x05 => DataTransportSize::Integer,
            0x07 => DataTransportSize::Real,
            0x09 => DataTransportSize::OctetString,
            _ => Err(())?,
        })
    }
}

/// Per-item return code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7ReturnCode {
    Reserved,
    Success,
    HardwareFault,
    AccessDenied,
    AddressOutOfRange,
    DataTypeNotSupported,
    DataTypeInconsistent,
    ObjectDoesNotExist,
    Unknown(u8),
}

impl From<u8> for S7ReturnCode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => S7ReturnCode::Reserved,
            0xFF => S7ReturnCode::Success,
            0x01 => S7ReturnCode::HardwareFault,
            0x03 => S7ReturnCode::AccessDenied,
            0x05 => S7ReturnCode::AddressOutOfRange,
            0x06 => S7ReturnCode::DataTypeNotSupported,
            0x07 => S7ReturnCode::DataTypeInconsistent,
            0x0A => S7ReturnCode::ObjectDoesNotExist,
            other => S7ReturnCode::Unknown(other),
        }
    }
}

impl From<S7ReturnCode> for u8 {
    fn from(value: S7ReturnCode) -> Self {
        match value {
            S7ReturnCode::Reserved => 0x00,
            S7ReturnCode::Success => 0xFF,
            S7ReturnCode::HardwareFault => 0x01,
            S7ReturnCode::AccessDenied => 0x03,
            S7ReturnCode::AddressOutOfRange => 0x05,
            S7ReturnCode::DataTypeNotSupported => 0x06,
            S7ReturnCode::DataTypeInconsistent => 0x07,
            S7ReturnCode::ObjectDoesNotExist => 0x0A,
            S7ReturnCode::Unknown(v) => v,
        }
    }
}

/// UserData function group (low nibble of the type/group byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFunctionGroup {
    ModeTransition = 0x00,
    CyclicServices = 0x02,
    CpuFunctions = 0x04,
}

impl TryFrom<u8> for CpuFunctionGroup {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CpuFunctionGroup::ModeTransition),
            0x02 => Ok(CpuFunctionGroup::CyclicServices),
            0x04 => Ok(CpuFunctionGroup::CpuFunctions),
            _ => Err(()),
        }
    }
}

/// UserData function type (high nibble of the type/group byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFunctionType {
    Push = 0x00,
    Request = 0x04,
    Response = 0x08,
}

impl TryFrom<u8> for CpuFunctionType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CpuFunctionType::Push),
            0x04 => Ok(CpuFunctionType::Request),
            0x08 => Ok(CpuFunctionType::Response),
            _ => Err(()),
        }
    }
}

/// CPU-function subfunction codes used by this driver
pub mod subfunction {
    pub const READ_SZL: u8 = 0x01;
    pub const MESSAGE_SERVICE: u8 = 0x02;
    pub const DIAGNOSTIC_MESSAGE: u8 = 0x03;
    pub const ALARM_8_INDICATION: u8 = 0x05;
    pub const NOTIFY_INDICATION: u8 = 0x06;
    pub const NOTIFY_8_INDICATION: u8 = 0x16;
    pub const ALARM_S_INDICATION: u8 = 0x11;
    pub const ALARM_SQ_INDICATION: u8 = 0x12;
    pub const ALARM_ACK_INDICATION: u8 = 0x0C;
    pub const ALARM_DQ_INDICATION: u8 = 0x13;

    pub const CYCLIC_TRANSFER: u8 = 0x01;
    pub const CYCLIC_UNSUBSCRIBE: u8 = 0x04;

    /// Every subfunction that carries an alarm or notify indication.
    pub const ALARMS: &[u8] = &[
        ALARM_8_INDICATION,
        NOTIFY_INDICATION,
        NOTIFY_8_INDICATION,
        ALARM_S_INDICATION,
        ALARM_SQ_INDICATION,
        ALARM_ACK_INDICATION,
        ALARM_DQ_INDICATION,
    ];
}
