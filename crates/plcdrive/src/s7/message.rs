//! Decoded S7 messages as they travel over ISO-on-TCP.
//!
//! The framing codec lives below the channel; these types carry only what the
//! driver logic reads and writes.

use plcrpc::Correlated;
use plcrpc::InvokeId;

use crate::api::ResponseCode;

/// A TPKT frame carrying one COTP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Tpkt {
    ConnectionRequest { called_tsap: u16, calling_tsap: u16, tpdu_size: u16 },
    ConnectionConfirm { parameters: Vec<CotpParameter> },
    Data { tpdu_ref: u16, message: S7Message },
}

impl Tpkt {
    /// Wraps an S7 message in a COTP data packet.
    pub fn data(tpdu_ref: u16, message: S7Message) -> Self {
        Self::Data { tpdu_ref, message }
    }

    pub fn into_message(self) -> Option<S7Message> {
        match self {
            Self::Data { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl Correlated for Tpkt {
    /// The S7 header's PDU reference; 0 marks messages that answer nothing.
    fn invoke_id(&self) -> Option<InvokeId> {
        match self {
            Self::Data { message, .. } if message.reference() != 0 => Some(InvokeId::from(message.reference())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CotpParameter {
    CalledTsap(u16),
    CallingTsap(u16),
    TpduSize(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub enum S7Message {
    Request { reference: u16, parameter: Parameter, payload: Payload },
    Response { reference: u16, error_class: u8, error_code: u8, parameter: Parameter, payload: Payload },
    UserData { reference: u16, parameter: Parameter, payload: Payload },
}

impl S7Message {
    pub fn reference(&self) -> u16 {
        match self {
            Self::Request { reference, .. } | Self::Response { reference, .. } | Self::UserData { reference, .. } => {
                *reference
            }
        }
    }

    pub fn parameter(&self) -> &Parameter {
        match self {
            Self::Request { parameter, .. } | Self::Response { parameter, .. } | Self::UserData { parameter, .. } => {
                parameter
            }
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Self::Request { payload, .. } | Self::Response { payload, .. } | Self::UserData { payload, .. } => payload,
        }
    }

    /// Header error class and code; always 0 for requests and user data.
    pub fn error(&self) -> (u8, u8) {
        match self {
            Self::Response { error_class, error_code, .. } => (*error_class, *error_code),
            _ => (0, 0),
        }
    }
}

/// Header class/code the PLC sends when PUT/GET access is disabled.
pub const ERROR_ACCESS_DISABLED: (u8, u8) = (0x81, 0x04);

/// CPU function group of user-data requests.
pub const CPU_FUNCTIONS: u8 = 0x04;
pub const SUBFUNCTION_READ_SZL: u8 = 0x01;
pub const SUBFUNCTION_MSG_SERVICE: u8 = 0x02;

/// SZL list holding the module identification (article number).
pub const SZL_MODULE_IDENTIFICATION: u16 = 0x0011;

#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    None,
    SetupCommunication { max_amq_caller: u16, max_amq_callee: u16, pdu_length: u16 },
    ReadVar(Vec<Address>),
    WriteVar(Vec<Address>),
    /// Acknowledges a read or write with the number of items.
    VarResponse { items: u8 },
    CpuFunction { method: u8, function_group: u8, subfunction: u8, sequence: u8 },
    ModeTransition { current_mode: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    /// Read results, or the values of a write request.
    Data(Vec<DataItem>),
    /// Per-item results of a write.
    Status(Vec<ReturnCode>),
    SzlRequest { szl_id: u16, index: u16 },
    SzlResponse { items: Vec<SzlItem> },
    Subscribe { events: u8 },
    SubscribeResult { code: ReturnCode },
    /// An event pushed by the PLC.
    Push { event: EventType, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub code: ReturnCode,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SzlItem {
    pub index: u16,
    /// Article number, e.g. `6ES7 212-1AE40-0XB0`.
    pub article_number: String,
}

/// Per-item return codes of read and write responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Reserved,
    Ok,
    AccessDenied,
    InvalidAddress,
    DataTypeNotSupported,
    NotFound,
    Other(u8),
}

impl ReturnCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Reserved,
            0xFF => Self::Ok,
            0x03 => Self::AccessDenied,
            0x05 => Self::InvalidAddress,
            0x06 => Self::DataTypeNotSupported,
            0x0A => Self::NotFound,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Reserved => 0x00,
            Self::Ok => 0xFF,
            Self::AccessDenied => 0x03,
            Self::InvalidAddress => 0x05,
            Self::DataTypeNotSupported => 0x06,
            Self::NotFound => 0x0A,
            Self::Other(code) => code,
        }
    }
}

impl From<ReturnCode> for ResponseCode {
    fn from(code: ReturnCode) -> Self {
        match code {
            ReturnCode::Ok => Self::Ok,
            ReturnCode::NotFound => Self::NotFound,
            ReturnCode::AccessDenied => Self::AccessDenied,
            ReturnCode::InvalidAddress => Self::InvalidAddress,
            ReturnCode::DataTypeNotSupported => Self::InvalidDataType,
            ReturnCode::Reserved | ReturnCode::Other(_) => Self::InternalError,
        }
    }
}

/// Classes of events a PLC pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Mode,
    System,
    User,
    Alarm,
}

impl EventType {
    /// Bit of this event class in a subscription mask.
    pub fn mask(self) -> u8 {
        match self {
            Self::Mode => 0x01,
            Self::System => 0x02,
            Self::User => 0x04,
            Self::Alarm => 0x80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryArea {
    Inputs,
    Outputs,
    Flags,
    DataBlocks,
    Counters,
    Timers,
}

impl MemoryArea {
    pub fn code(self) -> u8 {
        match self {
            Self::Inputs => 0x81,
            Self::Outputs => 0x82,
            Self::Flags => 0x83,
            Self::DataBlocks => 0x84,
            Self::Counters => 0x1C,
            Self::Timers => 0x1D,
        }
    }
}

/// Wire transport sizes of an any-pointer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSize {
    Bit,
    Byte,
    Char,
    Word,
    Int,
    DWord,
    DInt,
    Real,
    LReal,
}

/// An S7 any-pointer address as it goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub transport_size: TransportSize,
    pub elements: u16,
    pub db_number: u16,
    pub area: MemoryArea,
    pub byte_offset: u16,
    pub bit_offset: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_zero_is_uncorrelated() {
        let setup = Tpkt::data(
            1,
            S7Message::Response {
                reference: 0,
                error_class: 0,
                error_code: 0,
                parameter: Parameter::SetupCommunication { max_amq_caller: 8, max_amq_callee: 8, pdu_length: 240 },
                payload: Payload::None,
            },
        );
        assert_eq!(setup.invoke_id(), None);
        assert_eq!(Tpkt::ConnectionConfirm { parameters: vec![] }.invoke_id(), None);

        let read = Tpkt::data(
            12,
            S7Message::Response {
                reference: 12,
                error_class: 0,
                error_code: 0,
                parameter: Parameter::VarResponse { items: 0 },
                payload: Payload::Data(vec![]),
            },
        );
        assert_eq!(read.invoke_id(), Some(12));
    }

    #[test]
    fn test_return_code_mapping() {
        assert_eq!(ReturnCode::from_code(0xFF), ReturnCode::Ok);
        assert_eq!(ResponseCode::from(ReturnCode::from_code(0x0A)), ResponseCode::NotFound);
        assert_eq!(ResponseCode::from(ReturnCode::from_code(0x06)), ResponseCode::InvalidDataType);
        assert_eq!(ResponseCode::from(ReturnCode::from_code(0x42)), ResponseCode::InternalError);
        assert_eq!(ReturnCode::from_code(0x42).code(), 0x42);
    }
}
