//! Decoded AMS/ADS packets.

use std::fmt;
use std::time::Duration;
use std::time::SystemTime;

use plcrpc::Correlated;
use plcrpc::InvokeId;

use crate::api::ResponseCode;
use crate::config::AmsAddress;

/// Reserved index groups.
pub const SYM_HNDBYNAME: u32 = 0xF003;
pub const SYM_VALBYHND: u32 = 0xF005;
pub const SUMUP_READ: u32 = 0xF080;
pub const SUMUP_WRITE: u32 = 0xF081;
pub const SUMUP_READ_WRITE: u32 = 0xF082;

/// Milliseconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_OFFSET_MS: u64 = 11_644_473_600_000;

#[derive(Debug, Clone, PartialEq)]
pub struct AmsPacket {
    pub target: AmsAddress,
    pub source: AmsAddress,
    pub invoke_id: u32,
    /// AMS header error; 0 unless the router rejected the packet.
    pub error_code: u32,
    pub data: AdsData,
}

impl AmsPacket {
    pub fn new(target: AmsAddress, source: AmsAddress, invoke_id: u32, data: AdsData) -> Self {
        Self { target, source, invoke_id, error_code: 0, data }
    }

    /// The answer to this packet: addresses swapped, same invoke id.
    pub fn reply(&self, data: AdsData) -> Self {
        Self::new(self.source, self.target, self.invoke_id, data)
    }
}

impl Correlated for AmsPacket {
    /// Device notifications carry invoke id 0.
    fn invoke_id(&self) -> Option<InvokeId> {
        (self.invoke_id != 0).then_some(self.invoke_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdsData {
    ReadRequest { index_group: u32, index_offset: u32, length: u32 },
    ReadResponse { result: ReturnCode, data: Vec<u8> },
    WriteRequest { index_group: u32, index_offset: u32, data: Vec<u8> },
    WriteResponse { result: ReturnCode },
    /// `items` is only set for sum-up requests; `data` holds what is written.
    ReadWriteRequest {
        index_group: u32,
        index_offset: u32,
        read_length: u32,
        items: Vec<MultiRequestItem>,
        data: Vec<u8>,
    },
    ReadWriteResponse { result: ReturnCode, data: Vec<u8> },
    AddNotificationRequest {
        index_group: u32,
        index_offset: u32,
        length: u32,
        transmission_mode: u32,
        max_delay: u32,
        cycle_time: u32,
    },
    AddNotificationResponse { result: ReturnCode, handle: u32 },
    DeleteNotificationRequest { handle: u32 },
    DeleteNotificationResponse { result: ReturnCode },
    DeviceNotification { stamps: Vec<StampHeader> },
}

/// One entry of a sum-up request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiRequestItem {
    Read { index_group: u32, index_offset: u32, length: u32 },
    Write { index_group: u32, index_offset: u32, length: u32 },
    ReadWrite { index_group: u32, index_offset: u32, read_length: u32, write_length: u32 },
}

/// Samples that share one timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampHeader {
    /// FILETIME: 100 ns ticks since 1601-01-01.
    pub timestamp: u64,
    pub samples: Vec<NotificationSample>,
}

impl StampHeader {
    /// The stamp as wall-clock time, at millisecond resolution.
    pub fn time(&self) -> SystemTime {
        let millis = (self.timestamp / 10_000).saturating_sub(FILETIME_UNIX_OFFSET_MS);
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSample {
    pub handle: u32,
    pub data: Vec<u8>,
}

/// ADS return codes the drivers tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    ServiceNotSupported,
    InvalidIndexGroup,
    InvalidIndexOffset,
    InvalidAccess,
    InvalidSize,
    InvalidData,
    NotReady,
    Busy,
    NotFound,
    SymbolNotFound,
    NotificationHandleInvalid,
    Timeout,
    AccessDenied,
    Other(u32),
}

impl ReturnCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x000 => Self::Ok,
            0x701 => Self::ServiceNotSupported,
            0x702 => Self::InvalidIndexGroup,
            0x703 => Self::InvalidIndexOffset,
            0x704 => Self::InvalidAccess,
            0x705 => Self::InvalidSize,
            0x706 => Self::InvalidData,
            0x707 => Self::NotReady,
            0x708 => Self::Busy,
            0x70C => Self::NotFound,
            0x710 => Self::SymbolNotFound,
            0x714 => Self::NotificationHandleInvalid,
            0x719 => Self::Timeout,
            0x723 => Self::AccessDenied,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Ok => 0x000,
            Self::ServiceNotSupported => 0x701,
            Self::InvalidIndexGroup => 0x702,
            Self::InvalidIndexOffset => 0x703,
            Self::InvalidAccess => 0x704,
            Self::InvalidSize => 0x705,
            Self::InvalidData => 0x706,
            Self::NotReady => 0x707,
            Self::Busy => 0x708,
            Self::NotFound => 0x70C,
            Self::SymbolNotFound => 0x710,
            Self::NotificationHandleInvalid => 0x714,
            Self::Timeout => 0x719,
            Self::AccessDenied => 0x723,
            Self::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:x})", self, self.code())
    }
}

impl From<ReturnCode> for ResponseCode {
    fn from(code: ReturnCode) -> Self {
        match code {
            ReturnCode::Ok => Self::Ok,
            ReturnCode::NotFound | ReturnCode::SymbolNotFound | ReturnCode::NotificationHandleInvalid => Self::NotFound,
            ReturnCode::AccessDenied | ReturnCode::InvalidAccess => Self::AccessDenied,
            ReturnCode::InvalidIndexGroup | ReturnCode::InvalidIndexOffset => Self::InvalidAddress,
            ReturnCode::InvalidSize => Self::InvalidDataType,
            _ => Self::RemoteError,
        }
    }
}

/// Little-endian cursor over the payload of a sum-up response.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() < len {
            return None;
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(head)
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn return_code(&mut self) -> Option<ReturnCode> {
        self.u32().map(ReturnCode::from_code)
    }
}
