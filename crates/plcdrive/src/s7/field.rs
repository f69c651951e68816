use crate::s7::message::Address;
use crate::s7::message::MemoryArea;
use crate::s7::message::TransportSize;

/// Data types a caller can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Byte,
    Char,
    Word,
    Int,
    DWord,
    DInt,
    Real,
    LReal,
    Time,
    LTime,
    Date,
    TimeOfDay,
    DateAndTime,
    /// Fixed-capacity string; the PLC stores two header bytes in front.
    String(u8),
    WString(u8),
}

impl DataType {
    /// Size of one element in bytes, as the PLC stores it.
    pub fn size(self) -> u16 {
        match self {
            Self::Bool | Self::Byte | Self::Char => 1,
            Self::Word | Self::Int | Self::Date => 2,
            Self::DWord | Self::DInt | Self::Real | Self::Time | Self::TimeOfDay => 4,
            Self::LReal | Self::LTime | Self::DateAndTime => 8,
            Self::String(len) => u16::from(len) + 2,
            Self::WString(len) => (u16::from(len) + 2) * 2,
        }
    }
}

/// A value in PLC memory, e.g. `%DB1.DBW10:INT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Field {
    pub area: MemoryArea,
    pub db_number: u16,
    pub byte_offset: u16,
    pub bit_offset: u8,
    pub data_type: DataType,
    pub elements: u16,
}

impl S7Field {
    pub fn new(area: MemoryArea, byte_offset: u16, data_type: DataType) -> Self {
        Self { area, db_number: 0, byte_offset, bit_offset: 0, data_type, elements: 1 }
    }

    /// A field inside data block `db_number`.
    pub fn db(db_number: u16, byte_offset: u16, data_type: DataType) -> Self {
        Self { db_number, ..Self::new(MemoryArea::DataBlocks, byte_offset, data_type) }
    }

    pub fn with_bit(mut self, bit_offset: u8) -> Self {
        self.bit_offset = bit_offset;
        self
    }

    pub fn with_elements(mut self, elements: u16) -> Self {
        self.elements = elements;
        self
    }

    /// Bytes this field occupies.
    pub fn byte_len(&self) -> usize {
        usize::from(self.data_type.size()) * usize::from(self.elements)
    }

    /// The any-pointer that reads this field.
    ///
    /// Date, time and string types are not understood by every controller, so
    /// they are requested as plain byte or char arrays of the same length.
    pub fn address(&self) -> Address {
        let (transport_size, elements) = match self.data_type {
            DataType::Bool => (TransportSize::Bit, self.elements),
            DataType::Byte => (TransportSize::Byte, self.elements),
            DataType::Char => (TransportSize::Char, self.elements),
            DataType::Word => (TransportSize::Word, self.elements),
            DataType::Int => (TransportSize::Int, self.elements),
            DataType::DWord => (TransportSize::DWord, self.elements),
            DataType::DInt => (TransportSize::DInt, self.elements),
            DataType::Real => (TransportSize::Real, self.elements),
            DataType::LReal => (TransportSize::LReal, self.elements),
            DataType::Time | DataType::LTime | DataType::Date | DataType::TimeOfDay | DataType::DateAndTime => {
                (TransportSize::Byte, self.elements * self.data_type.size())
            }
            DataType::String(_) | DataType::WString(_) => (TransportSize::Char, self.elements * self.data_type.size()),
        };
        Address {
            transport_size,
            elements,
            db_number: self.db_number,
            area: self.area,
            byte_offset: self.byte_offset,
            bit_offset: self.bit_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_types_keep_their_transport_size() {
        let address = S7Field::db(1, 10, DataType::Int).with_elements(3).address();
        assert_eq!(address.transport_size, TransportSize::Int);
        assert_eq!(address.elements, 3);
        assert_eq!(address.area, MemoryArea::DataBlocks);
        assert_eq!(address.db_number, 1);
    }

    #[test]
    fn test_time_and_string_types_become_arrays() {
        let time = S7Field::db(1, 0, DataType::DateAndTime).with_elements(2).address();
        assert_eq!((time.transport_size, time.elements), (TransportSize::Byte, 16));

        let text = S7Field::db(1, 0, DataType::String(20)).address();
        assert_eq!((text.transport_size, text.elements), (TransportSize::Char, 22));

        let wide = S7Field::db(1, 0, DataType::WString(10)).address();
        assert_eq!((wide.transport_size, wide.elements), (TransportSize::Char, 24));
    }
}
