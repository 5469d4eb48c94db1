//! Fixed-layout records making a message self-describing.
//!
//! A message opens with a size prefix and a [`MetaData`] header, followed by a run of
//! [`DataDescriptor`]s, each immediately followed by its payload. Compound values (sequences
//! and tuples) carry a payload that is itself a contiguous run of child descriptors.
//!
//! Parsed values are exposed through [`DataView`], which borrows the underlying bytes. While a
//! view is alive the message cannot be written to, so a walk over nested descriptors can never
//! observe storage that a growth has since released.
use std::fmt;

use super::{FullVersion, MessageType, WireError};

/// Size of the leading total-size field.
pub const SIZE_PREFIX: usize = 4;
/// Size of an encoded [`MetaData`].
pub const METADATA_SIZE: usize = 12;
/// Offset of the first descriptor in every message.
pub const HEADER_SIZE: usize = SIZE_PREFIX + METADATA_SIZE;
/// Size of an encoded [`DataDescriptor`].
pub const DESCRIPTOR_SIZE: usize = 8;

/// Alignment of every descriptor.
pub(crate) const WORD: usize = 4;
/// Alignment of payloads holding 64-bit values.
pub(crate) const WIDE_ALIGNMENT: usize = 8;

/// Wire type tag carried by every descriptor.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int32 = 0,
    Int64 = 1,
    Uint32 = 2,
    Uint64 = 3,
    Bool = 4,
    String = 5,
    Object = 6,
    Enum = 7,
    Vector = 8,
    SimpleVector = 9,
    EmptyVector = 10,
    Tuple = 11,
}

impl DataType {
    /// Primitive payloads are raw bytes; the others hold nested descriptors.
    pub fn is_primitive(self) -> bool {
        !matches!(self, DataType::Vector | DataType::Tuple)
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for DataType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => DataType::Int32,
            1 => DataType::Int64,
            2 => DataType::Uint32,
            3 => DataType::Uint64,
            4 => DataType::Bool,
            5 => DataType::String,
            6 => DataType::Object,
            7 => DataType::Enum,
            8 => DataType::Vector,
            9 => DataType::SimpleVector,
            10 => DataType::EmptyVector,
            11 => DataType::Tuple,
            tag => return Err(WireError::malformed(format!("unknown data type tag {tag}"))),
        })
    }
}

/// Typed, sized header preceding every serialized value.
///
/// `size` counts everything after the descriptor: the alignment gap (`data_offset`), the
/// payload and the trailing `padding`. It is always a multiple of four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub data_type: DataType,
    pub padding: u8,
    pub data_offset: u8,
    pub element_size: u8,
    pub size: u32,
}

impl DataDescriptor {
    /// Describes a primitive payload of `payload_len` bytes, padded to a word.
    pub fn new(data_type: DataType, payload_len: usize) -> Result<Self, WireError> {
        let padding = (WORD - payload_len % WORD) % WORD;
        let size = payload_len
            .checked_add(padding)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or(WireError::TooLarge { size: payload_len })?;

        Ok(Self {
            data_type,
            padding: padding as u8,
            data_offset: 0,
            element_size: 0,
            size,
        })
    }

    /// Describes a compound value whose children occupy `children_len` bytes.
    pub fn compound(data_type: DataType, children_len: u32) -> Self {
        Self {
            data_type,
            padding: 0,
            data_offset: 0,
            element_size: 0,
            size: children_len,
        }
    }

    pub fn with_element_size(mut self, element_size: u8) -> Self {
        self.element_size = element_size;
        self
    }

    pub fn payload_len(&self) -> usize {
        self.size as usize - self.padding as usize - self.data_offset as usize
    }

    /// Bytes taken by the descriptor together with everything it describes.
    pub fn total_len(&self) -> usize {
        DESCRIPTOR_SIZE + self.size as usize
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let size = self.size.to_le_bytes();
        [
            self.data_type.into(),
            self.padding,
            self.data_offset,
            self.element_size,
            size[0],
            size[1],
            size[2],
            size[3],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let raw: [u8; DESCRIPTOR_SIZE] = bytes
            .get(..DESCRIPTOR_SIZE)
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| WireError::malformed("truncated data descriptor"))?;

        let descriptor = Self {
            data_type: raw[0].try_into()?,
            padding: raw[1],
            data_offset: raw[2],
            element_size: raw[3],
            size: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        };

        if descriptor.size as usize % WORD != 0 {
            return Err(WireError::malformed(format!(
                "descriptor size {} is not word aligned",
                descriptor.size
            )));
        }
        if descriptor.padding as usize + descriptor.data_offset as usize > descriptor.size as usize
        {
            return Err(WireError::malformed(format!(
                "descriptor padding {} and offset {} exceed size {}",
                descriptor.padding, descriptor.data_offset, descriptor.size
            )));
        }
        Ok(descriptor)
    }
}

/// Fixed header placed right after the size prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaData {
    pub version: u32,
    pub config: u32,
    pub message_type: MessageType,
    pub count: u16,
}

impl MetaData {
    pub fn full_version(&self) -> FullVersion {
        FullVersion::from_parts(self.config, self.version)
    }

    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut out = [0; METADATA_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.config.to_le_bytes());
        out[8..10].copy_from_slice(&self.message_type.raw().to_le_bytes());
        out[10..12].copy_from_slice(&self.count.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let raw: [u8; METADATA_SIZE] = bytes
            .get(..METADATA_SIZE)
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| WireError::malformed("truncated message metadata"))?;

        Ok(Self {
            version: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            config: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            message_type: MessageType::from_raw(u16::from_le_bytes([raw[8], raw[9]])),
            count: u16::from_le_bytes([raw[10], raw[11]]),
        })
    }
}

/// A parsed descriptor together with the payload bytes it describes.
#[derive(Clone, Copy)]
pub struct DataView<'a> {
    descriptor: DataDescriptor,
    payload: &'a [u8],
}

impl<'a> DataView<'a> {
    /// Parses the descriptor at the start of `bytes`, returning it and whatever follows it.
    pub fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), WireError> {
        let descriptor = DataDescriptor::from_bytes(bytes)?;
        let end = descriptor.total_len();
        if bytes.len() < end {
            return Err(WireError::malformed(format!(
                "{:?} value needs {end} bytes, {} remain",
                descriptor.data_type,
                bytes.len()
            )));
        }

        let start = DESCRIPTOR_SIZE + descriptor.data_offset as usize;
        let payload = &bytes[start..end - descriptor.padding as usize];
        Ok((
            Self {
                descriptor,
                payload,
            },
            &bytes[end..],
        ))
    }

    pub fn descriptor(&self) -> &DataDescriptor {
        &self.descriptor
    }

    pub fn data_type(&self) -> DataType {
        self.descriptor.data_type
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Fails with a type mismatch unless this value carries `expected`.
    pub fn expect(&self, expected: DataType) -> Result<(), WireError> {
        if self.descriptor.data_type != expected {
            return Err(WireError::TypeMismatch {
                expected,
                found: self.descriptor.data_type,
            });
        }
        Ok(())
    }

    /// Walks the child descriptors of a compound value in order.
    pub fn children(&self) -> Children<'a> {
        let rest = if self.descriptor.data_type.is_primitive() {
            &[][..]
        } else {
            self.payload
        };
        Children { rest }
    }
}

impl fmt::Debug for DataView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataView")
            .field("descriptor", &self.descriptor)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Iterator over the children of a compound [`DataView`].
#[derive(Debug, Clone)]
pub struct Children<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<DataView<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        match DataView::parse(self.rest) {
            Ok((view, rest)) => {
                self.rest = rest;
                Some(Ok(view))
            }
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}
