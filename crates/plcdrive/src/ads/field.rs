use std::time::Duration;

/// IEC 61131-3 types as TwinCAT stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Byte,
    Word,
    DWord,
    LWord,
    SInt,
    USInt,
    Int,
    UInt,
    DInt,
    UDInt,
    LInt,
    ULInt,
    Real,
    LReal,
    Time,
    Date,
    TimeOfDay,
    DateAndTime,
    /// `STRING(n)`: n characters plus the terminating nul.
    String(u16),
    /// `WSTRING(n)`: n UTF-16 units plus the terminating nul.
    WString(u16),
}

impl DataType {
    pub fn size(self) -> u32 {
        match self {
            Self::Bool | Self::Byte | Self::SInt | Self::USInt => 1,
            Self::Word | Self::Int | Self::UInt => 2,
            Self::DWord | Self::DInt | Self::UDInt | Self::Real => 4,
            Self::Time | Self::Date | Self::TimeOfDay | Self::DateAndTime => 4,
            Self::LWord | Self::LInt | Self::ULInt | Self::LReal => 8,
            Self::String(len) => u32::from(len) + 1,
            Self::WString(len) => (u32::from(len) + 1) * 2,
        }
    }
}

/// A value addressed by index group and offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectField {
    pub index_group: u32,
    pub index_offset: u32,
    pub data_type: DataType,
    pub elements: u32,
}

impl DirectField {
    pub fn byte_len(&self) -> u32 {
        self.data_type.size().saturating_mul(self.elements)
    }
}

/// A value addressed by its symbol name, e.g. `MAIN.counter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicField {
    pub name: String,
    pub data_type: DataType,
    pub elements: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Direct(DirectField),
    /// Resolved to a symbol handle before first use.
    Symbolic(SymbolicField),
}

impl Field {
    pub fn direct(index_group: u32, index_offset: u32, data_type: DataType) -> Self {
        Self::Direct(DirectField { index_group, index_offset, data_type, elements: 1 })
    }

    pub fn symbolic(name: impl Into<String>, data_type: DataType) -> Self {
        Self::Symbolic(SymbolicField { name: name.into(), data_type, elements: 1 })
    }

    pub fn with_elements(mut self, elements: u32) -> Self {
        match &mut self {
            Self::Direct(field) => field.elements = elements,
            Self::Symbolic(field) => field.elements = elements,
        }
        self
    }
}

/// When the device sends a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    /// Every `cycle`.
    Cyclic(Duration),
    /// When the value changes, checked every `cycle`.
    OnChange(Duration),
}

impl NotificationMode {
    pub(crate) fn transmission_mode(self) -> u32 {
        match self {
            Self::Cyclic(_) => 3,
            Self::OnChange(_) => 4,
        }
    }

    /// Cycle time in milliseconds, as the device expects it.
    pub(crate) fn cycle_time(self) -> u32 {
        let (Self::Cyclic(cycle) | Self::OnChange(cycle)) = self;
        u32::try_from(cycle.as_millis()).unwrap_or(u32::MAX)
    }
}

/// What an ADS subscription item watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub field: Field,
    pub mode: NotificationMode,
}

impl Notification {
    pub fn cyclic(field: Field, cycle: Duration) -> Self {
        Self { field, mode: NotificationMode::Cyclic(cycle) }
    }

    pub fn on_change(field: Field, cycle: Duration) -> Self {
        Self { field, mode: NotificationMode::OnChange(cycle) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_sizes_include_terminator() {
        assert_eq!(DataType::String(80).size(), 81);
        assert_eq!(DataType::WString(80).size(), 162);
    }

    #[test]
    fn test_elements_scale_byte_len() {
        let Field::Direct(field) = Field::direct(0x4020, 0, DataType::Int).with_elements(5) else {
            panic!("expected a direct field");
        };
        assert_eq!(field.byte_len(), 10);
    }

    #[test]
    fn test_notification_mode_codes() {
        let cyclic = NotificationMode::Cyclic(Duration::from_millis(250));
        assert_eq!((cyclic.transmission_mode(), cyclic.cycle_time()), (3, 250));
        let change = NotificationMode::OnChange(Duration::from_secs(1));
        assert_eq!((change.transmission_mode(), change.cycle_time()), (4, 1000));
    }
}
