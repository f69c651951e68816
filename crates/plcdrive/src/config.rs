//! Driver configuration.

use std::fmt;
use std::time::Duration;

use plcrpc::ConversationConfig;

/// Controller families the S7 driver distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum ControllerType {
    /// Unknown; the handshake asks the controller to identify itself.
    Any,
    S7_300,
    S7_400,
    S7_1200,
    S7_1500,
}

impl ControllerType {
    /// Derives the family from a Siemens article number such as `6ES7 212-1AE40-0XB0`.
    pub fn from_article_number(article: &str) -> Self {
        let Some(model) = article.strip_prefix("6ES7 ") else {
            return Self::Any;
        };
        match model.chars().next() {
            Some('2') => Self::S7_1200,
            Some('5') => Self::S7_1500,
            Some('3') => Self::S7_300,
            Some('4') => Self::S7_400,
            _ => {
                tracing::info!(article, "unknown article number");
                Self::Any
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct S7Config {
    pub calling_tsap: u16,
    pub called_tsap: u16,
    /// Requested COTP TPDU size in bytes.
    pub tpdu_size: u16,
    /// Requested S7 PDU size in bytes.
    pub pdu_size: u16,
    pub max_amq_caller: u16,
    pub max_amq_callee: u16,
    pub controller_type: ControllerType,
    /// Another party set the connection up; skip the handshake.
    pub passive: bool,
    pub request_timeout: Duration,
}

impl Default for S7Config {
    fn default() -> Self {
        Self {
            calling_tsap: 0x0100,
            called_tsap: 0x0102,
            tpdu_size: 1024,
            pdu_size: 1024,
            max_amq_caller: 8,
            max_amq_callee: 8,
            controller_type: ControllerType::Any,
            passive: false,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl S7Config {
    /// Addresses the CPU in `rack` / `slot` (called TSAP `0x01RS`).
    pub fn with_rack_slot(mut self, rack: u8, slot: u8) -> Self {
        self.called_tsap = 0x0100 | (u16::from(rack & 0x07) << 5) | u16::from(slot & 0x1f);
        self
    }

    pub fn with_controller_type(mut self, controller_type: ControllerType) -> Self {
        self.controller_type = controller_type;
        self
    }

    pub fn with_pdu_size(mut self, pdu_size: u16) -> Self {
        self.pdu_size = pdu_size;
        self
    }

    pub fn with_max_amq(mut self, caller: u16, callee: u16) -> Self {
        self.max_amq_caller = caller;
        self.max_amq_callee = callee;
        self
    }

    pub fn with_passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub(crate) fn conversation(&self) -> ConversationConfig {
        ConversationConfig::default()
            .with_request_timeout(self.request_timeout)
            .with_initial_concurrency(1)
            .with_invoke_ids(10, 0xFFFF)
    }
}

/// Six-byte AMS network id, written `a.b.c.d.e.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AmsNetId(pub [u8; 6]);

impl fmt::Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", a, b, c, d, e, g)
    }
}

/// An AMS endpoint: net id plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AmsAddress {
    pub net_id: AmsNetId,
    pub port: u16,
}

impl fmt::Display for AmsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct AdsConfig {
    pub target: AmsAddress,
    pub source: AmsAddress,
    pub request_timeout: Duration,
    /// Requests allowed in flight at once.
    pub concurrency: usize,
}

impl Default for AdsConfig {
    fn default() -> Self {
        Self {
            target: AmsAddress { net_id: AmsNetId([127, 0, 0, 1, 1, 1]), port: 851 },
            source: AmsAddress { net_id: AmsNetId([127, 0, 0, 1, 1, 2]), port: 32768 },
            request_timeout: Duration::from_secs(5),
            concurrency: 1,
        }
    }
}

impl AdsConfig {
    pub fn with_target(mut self, net_id: AmsNetId, port: u16) -> Self {
        self.target = AmsAddress { net_id, port };
        self
    }

    pub fn with_source(mut self, net_id: AmsNetId, port: u16) -> Self {
        self.source = AmsAddress { net_id, port };
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub(crate) fn conversation(&self) -> ConversationConfig {
        ConversationConfig::default()
            .with_request_timeout(self.request_timeout)
            .with_initial_concurrency(self.concurrency)
            .with_invoke_ids(1, u32::MAX)
    }
}
