//! Remote compilation wire protocol.
//!
//! This module defines the protocol spoken between a compilation client and a compilation
//! server: the self-describing message format, the typed marshaling rules that map Rust
//! values onto it, and the blocking transport that frames messages over a byte stream.
//!
//! # Overview
//!
//! A compilation client ships compilation requests to a server; while compiling, the server
//! may send callback queries back to the client, which answers them on the same connection.
//! Every exchange is a single [`Message`] travelling in one direction at a time.
//!
//! Data flows through the layers as follows:
//!
//! ```text
//! values --pack--> Message (WireBuffer) --Transport::write_message--> socket
//! socket --Transport::read_message--> Message --unpack--> values
//! ```
//!
//! # Key Components
//!
//! - [`WireBuffer`]: Growable byte store addressed by offsets, so growth never invalidates
//!   positions recorded by a builder.
//! - [`Message`]: Header plus an ordered run of typed [`DataDescriptor`]s.
//! - [`Pack`] / [`Unpack`]: Compile-time selected encoding rules for each value category.
//! - [`Transport`]: Framed, blocking read/write of whole messages over any `Read + Write`.
//! - [`ClientStream`] / [`ServerStream`]: Role-specific conversations on top of a transport.
//!
//! # Binary Format
//!
//! ```text
//! [u32 total size, including this field]
//! [MetaData: version:u32, config:u32, type:u16, count:u16]
//! count times:
//!   [DataDescriptor: type:u8, padding:u8, data_offset:u8, element_size:u8, size:u32]
//!   [data_offset bytes of alignment padding]
//!   [payload][padding bytes]
//! ```
//!
//! All integers are little-endian. Descriptors always start on a 4-byte boundary and payloads
//! of 64-bit values start on an 8-byte boundary, measured from the start of the message.
//!
//! # See Also
//!
//! - [`diagnostic`](crate::diagnostic): A small compilation handler exercising the full protocol.
mod allocator;
mod buffer;
mod codec;
mod descriptor;
mod message;
mod server;
mod stream;
mod thread;
mod transport;
mod version;

use thread::ThreadPool;

pub use allocator::{
    AllocatorStats, ByteAllocator, HeapAllocator, SharedAllocator, shared_allocator,
};
pub use buffer::WireBuffer;
pub use codec::{
    Bytes, Handle, Pack, PackArgs, Unpack, UnpackArgs, WireType, pack, pack_enum, pack_object,
    unpack, unpack_enum, unpack_object,
};
pub use descriptor::{
    Children, DESCRIPTOR_SIZE, DataDescriptor, DataType, DataView, HEADER_SIZE, METADATA_SIZE,
    MetaData, SIZE_PREFIX,
};
pub use error::WireError;
pub use message::{Message, MessageType};
pub use server::{CompilationHandler, CompileServer, ShutdownHandle};
pub use stream::{ClientStream, ServerStream, status};
pub use transport::{
    DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, StreamError, Transport, TransportConfig,
    TransportState,
};
pub use version::{ConfigurationFlags, FullVersion, PROTOCOL_VERSION};

pub mod error {
    use thiserror::Error;

    use super::descriptor::DataType;

    /// Errors raised while building, parsing or marshaling a [`Message`](super::Message).
    #[derive(Debug, Error)]
    pub enum WireError {
        #[error("failed to allocate {requested} bytes for a wire buffer")]
        OutOfMemory { requested: usize },

        #[error("type mismatch: expected {expected:?}, found {found:?}")]
        TypeMismatch { expected: DataType, found: DataType },

        #[error("arity mismatch: expected {expected} values, message holds {found}")]
        ArityMismatch { expected: usize, found: usize },

        #[error("message cannot hold more than {} data points", u16::MAX)]
        TooManyDataPoints,

        #[error("encoded size of {size} bytes exceeds the wire limit")]
        TooLarge { size: usize },

        #[error("range {offset}..{offset}+{len} is outside a buffer of {size} bytes")]
        OutOfBounds {
            offset: usize,
            len: usize,
            size: usize,
        },

        #[error("malformed message: {reason}")]
        Malformed { reason: String },

        #[error("failed to encode object: {0}")]
        ObjectEncode(#[from] bincode::error::EncodeError),

        #[error("failed to decode object: {0}")]
        ObjectDecode(#[from] bincode::error::DecodeError),
    }

    impl WireError {
        pub(crate) fn malformed(reason: impl Into<String>) -> Self {
            Self::Malformed {
                reason: reason.into(),
            }
        }
    }
}
