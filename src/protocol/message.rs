//! Self-describing protocol message.
//!
//! A [`Message`] owns one [`WireBuffer`] and the offsets of its top-level data points. It is
//! either being written (built incrementally, then serialized) or being read (filled by the
//! transport, then reconstructed). Both modes reuse the same storage across exchanges.
//!
//! # Offsets, not pointers
//!
//! Any write may grow the buffer and move its storage. The message therefore records only
//! offsets, and compound values reserve their descriptor slot up front and patch it by offset
//! once their children have been written.
use std::{fmt, sync::Arc};

use log::trace;

use super::{
    ByteAllocator, DEFAULT_INITIAL_CAPACITY, DataDescriptor, DataView, FullVersion, HEADER_SIZE,
    METADATA_SIZE, MetaData, Pack, SIZE_PREFIX, WireBuffer, WireError,
    descriptor::{DESCRIPTOR_SIZE, WIDE_ALIGNMENT},
    shared_allocator,
};

/// Tag identifying what a message is for.
///
/// The protocol layer names the control tags it acts on. Every other value is an opaque query
/// tag owned by the compilation engine, built with [`MessageType::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MessageType(u16);

impl MessageType {
    pub const HANDSHAKE: Self = Self(1);
    pub const VERSION_INCOMPATIBLE: Self = Self(2);
    pub const COMPILATION_REQUEST: Self = Self(3);
    pub const COMPILATION_CODE: Self = Self(4);
    pub const COMPILATION_FAILURE: Self = Self(5);
    pub const COMPILATION_INTERRUPTED: Self = Self(6);
    pub const CONNECTION_TERMINATE: Self = Self(7);
    pub const CLIENT_SESSION_TERMINATE: Self = Self(8);

    const FIRST_QUERY: u16 = 64;

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Engine-defined query tag number `n`.
    pub const fn query(n: u16) -> Self {
        Self(Self::FIRST_QUERY.saturating_add(n))
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::HANDSHAKE => "handshake",
            Self::VERSION_INCOMPATIBLE => "versionIncompatible",
            Self::COMPILATION_REQUEST => "compilationRequest",
            Self::COMPILATION_CODE => "compilationCode",
            Self::COMPILATION_FAILURE => "compilationFailure",
            Self::COMPILATION_INTERRUPTED => "compilationInterrupted",
            Self::CONNECTION_TERMINATE => "connectionTerminate",
            Self::CLIENT_SESSION_TERMINATE => "clientSessionTerminate",
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None if self.0 >= Self::FIRST_QUERY => {
                write!(f, "query#{}", self.0 - Self::FIRST_QUERY)
            }
            None => write!(f, "unknown#{}", self.0),
        }
    }
}

pub struct Message {
    meta: MetaData,
    offsets: Vec<usize>,
    buffer: WireBuffer,
}

impl Message {
    /// Creates an empty message in write mode using the shared allocator.
    pub fn new() -> Result<Self, WireError> {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, WireError> {
        Self::with_allocator(capacity, shared_allocator())
    }

    pub fn with_allocator(
        capacity: usize,
        allocator: Arc<dyn ByteAllocator>,
    ) -> Result<Self, WireError> {
        let mut message = Self {
            meta: MetaData::default(),
            offsets: Vec::new(),
            buffer: WireBuffer::with_allocator(capacity, allocator)?,
        };
        message.clear_for_write()?;
        Ok(message)
    }

    pub fn metadata(&self) -> &MetaData {
        &self.meta
    }

    pub fn message_type(&self) -> MessageType {
        self.meta.message_type
    }

    pub fn set_type(&mut self, message_type: MessageType) {
        self.meta.message_type = message_type;
    }

    pub fn full_version(&self) -> FullVersion {
        self.meta.full_version()
    }

    pub fn set_full_version(&mut self, version: FullVersion) {
        self.meta.version = version.version;
        self.meta.config = version.config.raw();
    }

    /// Number of top-level data points.
    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    /// Buffer offsets of the top-level descriptors, in order.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn buffer(&self) -> &WireBuffer {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut WireBuffer {
        &mut self.buffer
    }

    /// Writes a top-level data point and records its offset.
    pub fn add_data_point(
        &mut self,
        descriptor: DataDescriptor,
        payload: &[u8],
        needs_wide_alignment: bool,
    ) -> Result<u32, WireError> {
        self.check_point_limit()?;
        self.atomically(|msg| {
            let offset = msg.buffer.len();
            let written = msg.write_data(descriptor, payload, needs_wide_alignment)?;
            msg.record_point(offset)?;
            Ok(written)
        })
    }

    /// Packs `value` as the next top-level data point.
    pub fn push<T: Pack + ?Sized>(&mut self, value: &T) -> Result<u32, WireError> {
        self.check_point_limit()?;
        self.atomically(|msg| {
            let offset = msg.buffer.len();
            let written = value.pack(msg)?;
            msg.record_point(offset)?;
            Ok(written)
        })
    }

    /// Runs `write`, discarding every byte and data point it added if it fails.
    pub fn atomically<R, F>(&mut self, write: F) -> Result<R, WireError>
    where
        F: FnOnce(&mut Self) -> Result<R, WireError>,
    {
        let len = self.buffer.len();
        let points = self.offsets.len();
        let result = write(self);
        if result.is_err() {
            self.buffer.truncate(len);
            self.offsets.truncate(points);
        }
        result
    }

    /// Writes a descriptor and its payload without recording a top-level offset. Used for
    /// children of compound values.
    pub fn write_data(
        &mut self,
        descriptor: DataDescriptor,
        payload: &[u8],
        needs_wide_alignment: bool,
    ) -> Result<u32, WireError> {
        if payload.len() != descriptor.payload_len() {
            return Err(WireError::malformed(format!(
                "descriptor announces {} payload bytes, {} given",
                descriptor.payload_len(),
                payload.len()
            )));
        }
        self.write_data_with(descriptor, needs_wide_alignment, |dst| {
            dst.copy_from_slice(payload);
            Ok(())
        })
    }

    /// Writes a descriptor, then lets `fill` write the payload in place.
    ///
    /// When `needs_wide_alignment` is set and the payload would not start on an 8-byte
    /// boundary, a word of padding is inserted and recorded in the descriptor's `data_offset`.
    pub fn write_data_with<F>(
        &mut self,
        mut descriptor: DataDescriptor,
        needs_wide_alignment: bool,
        fill: F,
    ) -> Result<u32, WireError>
    where
        F: FnOnce(&mut [u8]) -> Result<(), WireError>,
    {
        self.atomically(|msg| {
            let buffer = &mut msg.buffer;
            let start = buffer.len();
            let slot = buffer.write_bytes(&descriptor.to_bytes())?;

            let misalignment = buffer.len() % WIDE_ALIGNMENT;
            if needs_wide_alignment && misalignment != 0 {
                let gap = WIDE_ALIGNMENT - misalignment;
                buffer.reserve_bytes(gap)?;
                descriptor.data_offset = gap as u8;
                descriptor.size = descriptor
                    .size
                    .checked_add(gap as u32)
                    .ok_or(WireError::TooLarge {
                        size: descriptor.size as usize + gap,
                    })?;
                buffer.write_at(slot, &descriptor.to_bytes())?;
            }

            let len = descriptor.payload_len();
            let payload = buffer.reserve_bytes(len)?;
            fill(buffer.bytes_mut(payload, len)?)?;
            buffer.reserve_bytes(descriptor.padding as usize)?;

            let written = buffer.len() - start;
            u32::try_from(written).map_err(|_| WireError::TooLarge { size: written })
        })
    }

    /// Reserves room for a descriptor that is patched once its children are written.
    pub fn reserve_descriptor_slot(&mut self) -> Result<usize, WireError> {
        self.buffer.reserve_bytes(DESCRIPTOR_SIZE)
    }

    pub fn patch_descriptor(
        &mut self,
        offset: usize,
        descriptor: DataDescriptor,
    ) -> Result<(), WireError> {
        self.buffer.write_at(offset, &descriptor.to_bytes())
    }

    /// Records `offset` as the start of the next top-level data point.
    pub fn record_point(&mut self, offset: usize) -> Result<(), WireError> {
        self.check_point_limit()?;
        self.offsets.push(offset);
        Ok(())
    }

    fn check_point_limit(&self) -> Result<(), WireError> {
        if self.offsets.len() >= u16::MAX as usize {
            return Err(WireError::TooManyDataPoints);
        }
        Ok(())
    }

    /// Resolves the top-level data point at `index`.
    pub fn data_point(&self, index: usize) -> Result<DataView<'_>, WireError> {
        let offset = *self
            .offsets
            .get(index)
            .ok_or(WireError::ArityMismatch {
                expected: index + 1,
                found: self.offsets.len(),
            })?;
        let (view, _) = DataView::parse(&self.buffer.as_slice()[offset..])?;
        Ok(view)
    }

    /// All top-level data points in order.
    pub fn data_points(&self) -> impl Iterator<Item = Result<DataView<'_>, WireError>> + '_ {
        (0..self.offsets.len()).map(|index| self.data_point(index))
    }

    /// Offset of the payload of top-level data point `index`, past any alignment gap.
    pub fn payload_offset(&self, index: usize) -> Result<usize, WireError> {
        let view = self.data_point(index)?;
        Ok(self.offsets[index] + DESCRIPTOR_SIZE + view.descriptor().data_offset as usize)
    }

    /// Re-derives the header and top-level offsets of a message whose bytes were just read.
    ///
    /// Payloads are skipped, not interpreted; nested descriptors are left to the codec.
    pub fn reconstruct_from_bytes(&mut self) -> Result<(), WireError> {
        let total = self.buffer.len();
        if total < HEADER_SIZE {
            return Err(WireError::malformed(format!(
                "message of {total} bytes is shorter than its header"
            )));
        }

        let declared = self.buffer.read_u32(0)? as usize;
        if declared != total {
            return Err(WireError::malformed(format!(
                "size prefix says {declared} bytes, buffer holds {total}"
            )));
        }

        self.meta = MetaData::from_bytes(self.buffer.bytes(SIZE_PREFIX, METADATA_SIZE)?)?;
        self.offsets.clear();

        let mut cursor = HEADER_SIZE;
        for _ in 0..self.meta.count {
            let remaining = self.buffer.bytes(cursor, total - cursor)?;
            let descriptor = DataDescriptor::from_bytes(remaining)?;
            if descriptor.total_len() > remaining.len() {
                return Err(WireError::malformed(format!(
                    "data point at offset {cursor} overruns the message"
                )));
            }
            self.offsets.push(cursor);
            cursor += descriptor.total_len();
        }

        if cursor != total {
            return Err(WireError::malformed(format!(
                "{} trailing bytes after {} data points",
                total - cursor,
                self.meta.count
            )));
        }

        trace!(
            "reconstructed {} message with {} data points ({total} bytes)",
            self.meta.message_type, self.meta.count
        );
        Ok(())
    }

    /// Backpatches the size prefix and header and returns the bytes to put on the wire.
    pub fn serialize(&mut self) -> Result<&[u8], WireError> {
        let total = self.buffer.len();
        let size = u32::try_from(total).map_err(|_| WireError::TooLarge { size: total })?;
        self.meta.count = self.offsets.len() as u16;

        self.buffer.write_at(0, &size.to_le_bytes())?;
        self.buffer.write_at(SIZE_PREFIX, &self.meta.to_bytes())?;
        Ok(self.buffer.as_slice())
    }

    /// Resets the message to receive bytes from the wire; the header arrives with them.
    pub fn clear_for_read(&mut self) {
        self.buffer.clear();
        self.offsets.clear();
        self.meta = MetaData::default();
    }

    /// Resets the message to be built again, with header space reserved. The header goes
    /// back to its defaults; the transport stamps its version on every write.
    pub fn clear_for_write(&mut self) -> Result<(), WireError> {
        self.clear_for_read();
        self.buffer.reserve_bytes(HEADER_SIZE)?;
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("meta", &self.meta)
            .field("offsets", &self.offsets)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::protocol::{DataType, SharedAllocator};

    use super::*;

    fn message(capacity: usize) -> Message {
        Message::with_allocator(capacity, Arc::new(SharedAllocator::new())).unwrap()
    }

    /// Copies the serialized bytes of `sent` into a fresh message and reconstructs it.
    fn received(sent: &mut Message) -> Message {
        let bytes = sent.serialize().unwrap().to_vec();
        let mut msg = message(16);
        msg.clear_for_read();
        msg.buffer_mut().write_bytes(&bytes).unwrap();
        msg.reconstruct_from_bytes().unwrap();
        msg
    }

    #[test]
    fn new_message_reserves_header() {
        let msg = message(64);
        assert_eq!(msg.buffer().len(), HEADER_SIZE);
        assert_eq!(msg.count(), 0);
    }

    #[test]
    fn serialize_backpatches_header() {
        let mut msg = message(64);
        msg.set_type(MessageType::COMPILATION_CODE);
        msg.set_full_version(FullVersion::from_parts(3, 9));
        let descriptor = DataDescriptor::new(DataType::Int32, 4).unwrap();
        msg.add_data_point(descriptor, &5i32.to_le_bytes(), false).unwrap();

        let bytes = msg.serialize().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 12);
        assert_eq!(&bytes[0..4], &28u32.to_le_bytes());

        let meta = MetaData::from_bytes(&bytes[4..]).unwrap();
        assert_eq!(meta.message_type, MessageType::COMPILATION_CODE);
        assert_eq!(meta.full_version(), FullVersion::from_parts(3, 9));
        assert_eq!(meta.count, 1);
    }

    #[test]
    fn add_data_point_pads_payload() {
        let mut msg = message(64);
        let descriptor = DataDescriptor::new(DataType::String, 5).unwrap();
        let written = msg.add_data_point(descriptor, b"hello", false).unwrap();
        assert_eq!(written, 16);
        assert_eq!(msg.offsets(), &[HEADER_SIZE]);

        let view = msg.data_point(0).unwrap();
        assert_eq!(view.payload(), b"hello");
    }

    #[test]
    fn wide_payloads_are_eight_byte_aligned() {
        let mut msg = message(64);
        let wide = DataDescriptor::new(DataType::Int64, 8).unwrap();
        let narrow = DataDescriptor::new(DataType::Int32, 4).unwrap();
        // Header (16) + descriptor (8) leaves the payload at 24: already aligned.
        msg.add_data_point(wide, &1u64.to_le_bytes(), true).unwrap();
        msg.add_data_point(narrow, &2i32.to_le_bytes(), false).unwrap();
        // 44 + 8 = 52: needs a gap.
        msg.add_data_point(wide, &3u64.to_le_bytes(), true).unwrap();

        assert_eq!(msg.data_point(0).unwrap().descriptor().data_offset, 0);
        assert_eq!(msg.data_point(2).unwrap().descriptor().data_offset, 4);
        for index in [0, 2] {
            assert_eq!(msg.payload_offset(index).unwrap() % 8, 0);
        }
        assert_eq!(msg.data_point(2).unwrap().payload(), &3u64.to_le_bytes());
    }

    #[test]
    fn payload_length_must_match_descriptor() {
        let mut msg = message(64);
        let descriptor = DataDescriptor::new(DataType::String, 4).unwrap();
        let err = msg.add_data_point(descriptor, b"abc", false).unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));
        assert_eq!(msg.count(), 0);
        assert_eq!(msg.buffer().len(), HEADER_SIZE);
    }

    #[test]
    fn reconstruct_rederives_offsets() {
        let mut msg = message(16);
        msg.set_type(MessageType::query(3));
        msg.push(&7u32).unwrap();
        msg.push("a longer string value").unwrap();
        msg.push(&vec![1u64, 2, 3]).unwrap();
        let offsets = msg.offsets().to_vec();

        let back = received(&mut msg);
        assert_eq!(back.offsets(), offsets.as_slice());
        assert_eq!(back.message_type(), MessageType::query(3));
        assert_eq!(back.data_point(1).unwrap().payload(), b"a longer string value");
    }

    #[test]
    fn reconstruct_rejects_wrong_prefix() {
        let mut msg = message(64);
        msg.push(&1i32).unwrap();
        let mut bytes = msg.serialize().unwrap().to_vec();
        bytes[0] += 4;

        let mut back = message(64);
        back.clear_for_read();
        back.buffer_mut().write_bytes(&bytes).unwrap();
        assert!(matches!(
            back.reconstruct_from_bytes(),
            Err(WireError::Malformed { .. })
        ));
    }

    #[test]
    fn reconstruct_rejects_overrun() {
        let mut msg = message(64);
        msg.push(&1i32).unwrap();
        let mut bytes = msg.serialize().unwrap().to_vec();
        // Claim a second data point that is not there.
        bytes[14] = 2;

        let mut back = message(64);
        back.clear_for_read();
        back.buffer_mut().write_bytes(&bytes).unwrap();
        assert!(back.reconstruct_from_bytes().is_err());
    }

    #[test]
    fn clear_for_write_resets_header() {
        let mut msg = message(64);
        msg.set_full_version(FullVersion::from_parts(1, 2));
        msg.set_type(MessageType::COMPILATION_CODE);
        msg.push(&1i32).unwrap();
        msg.clear_for_write().unwrap();
        assert_eq!(msg.metadata(), &MetaData::default());
        assert_eq!(msg.count(), 0);
        assert_eq!(msg.buffer().len(), HEADER_SIZE);
    }

    #[test]
    fn point_limit_leaves_message_intact() {
        let mut msg = message(16);
        for value in 0..u16::MAX as u32 {
            msg.push(&value).unwrap();
        }
        let len = msg.buffer().len();

        assert!(matches!(msg.push(&7u32), Err(WireError::TooManyDataPoints)));
        let descriptor = DataDescriptor::new(DataType::Uint32, 4).unwrap();
        assert!(matches!(
            msg.add_data_point(descriptor, &7u32.to_le_bytes(), false),
            Err(WireError::TooManyDataPoints)
        ));
        assert_eq!(msg.buffer().len(), len);
        assert_eq!(msg.count(), u16::MAX as usize);

        let back = received(&mut msg);
        assert_eq!(back.count(), u16::MAX as usize);
        assert_eq!(back.data_point(65_534).unwrap().payload(), &65_534u32.to_le_bytes());
    }

    #[test]
    fn failed_fill_is_rolled_back() {
        let mut msg = message(16);
        msg.push(&1i32).unwrap();
        let len = msg.buffer().len();

        let descriptor = DataDescriptor::new(DataType::String, 64).unwrap();
        let err = msg
            .write_data_with(descriptor, false, |_| Err(WireError::malformed("fill failed")))
            .unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));
        assert_eq!(msg.buffer().len(), len);

        msg.push("after").unwrap();
        let back = received(&mut msg);
        assert_eq!(back.data_point(1).unwrap().payload(), b"after");
    }

    #[test]
    fn message_type_display() {
        assert_eq!(MessageType::COMPILATION_REQUEST.to_string(), "compilationRequest");
        assert_eq!(MessageType::query(5).to_string(), "query#5");
        assert_eq!(MessageType::default().to_string(), "unknown#0");
    }

    #[derive(Debug, Clone)]
    enum Point {
        Int(i32),
        Wide(u64),
        Text(String),
        List(Vec<u32>),
    }

    fn point_strategy() -> impl Strategy<Value = Point> {
        prop_oneof![
            any::<i32>().prop_map(Point::Int),
            any::<u64>().prop_map(Point::Wide),
            ".{0,40}".prop_map(Point::Text),
            prop::collection::vec(any::<u32>(), 0..40).prop_map(Point::List),
        ]
    }

    fn push_point(msg: &mut Message, point: &Point) {
        match point {
            Point::Int(v) => msg.push(v),
            Point::Wide(v) => msg.push(v),
            Point::Text(v) => msg.push(v),
            Point::List(v) => msg.push(v),
        }
        .unwrap();
    }

    fn point_bytes(msg: &Message, index: usize) -> Vec<u8> {
        let start = msg.offsets()[index];
        let end = msg.offsets().get(index + 1).copied().unwrap_or(msg.buffer().len());
        msg.buffer().bytes(start, end - start).unwrap().to_vec()
    }

    proptest! {
        #[test]
        fn growth_keeps_written_points(points in prop::collection::vec(point_strategy(), 1..40)) {
            let mut msg = message(16);
            let mut snapshots = Vec::new();

            for point in &points {
                push_point(&mut msg, point);
                let index = msg.count() - 1;
                snapshots.push((msg.offsets()[index], point_bytes(&msg, index)));
            }

            for (index, (offset, bytes)) in snapshots.iter().enumerate() {
                prop_assert_eq!(msg.offsets()[index], *offset);
                prop_assert_eq!(&point_bytes(&msg, index), bytes);
            }
        }

        #[test]
        fn cleared_message_matches_fresh(
            before in prop::collection::vec(point_strategy(), 0..20),
            after in prop::collection::vec(point_strategy(), 0..20),
        ) {
            let mut reused = message(16);
            reused.set_type(MessageType::query(9));
            reused.set_full_version(FullVersion::from_parts(0xFF, 0xABCD));
            for point in &before {
                push_point(&mut reused, point);
            }
            reused.clear_for_write().unwrap();

            let mut fresh = message(16);
            for point in &after {
                push_point(&mut reused, point);
                push_point(&mut fresh, point);
            }

            prop_assert_eq!(reused.offsets(), fresh.offsets());
            prop_assert_eq!(reused.serialize().unwrap(), fresh.serialize().unwrap());
        }
    }
}
