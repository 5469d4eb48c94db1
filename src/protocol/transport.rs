use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
};

use log::{info, trace, warn};
use thiserror::Error;

use super::{FullVersion, Message, MessageType, SIZE_PREFIX, WireError, descriptor::HEADER_SIZE};

pub const DEFAULT_INITIAL_CAPACITY: usize = 4096;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream failure: {reason}")]
    Failure {
        reason: String,
        retry_immediately: bool,
    },

    #[error("operation interrupted by peer")]
    Interrupted,

    #[error("connection terminated by peer")]
    ConnectionTerminated,

    #[error("session of client {client_id} terminated")]
    SessionTerminated { client_id: u64 },

    #[error("message received out of order")]
    OutOfOrder,

    #[error("expected a {expected} message, received {found}")]
    MessageTypeMismatch {
        expected: MessageType,
        found: MessageType,
    },

    #[error("incompatible peer version {peer}, local version is {local}")]
    VersionIncompatible {
        local: FullVersion,
        peer: FullVersion,
    },

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl StreamError {
    /// Errors after which no connection to this peer can be used again.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::VersionIncompatible { .. } | StreamError::SessionTerminated { .. }
        )
    }

    /// Errors after which the current connection must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, StreamError::Interrupted | StreamError::OutOfOrder)
    }
}

impl From<io::Error> for StreamError {
    fn from(value: io::Error) -> Self {
        // A peer that went away cleanly may be back on a new connection straight away.
        let retry_immediately = matches!(
            value.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::WriteZero | ErrorKind::ConnectionReset
        );
        StreamError::Failure {
            reason: value.to_string(),
            retry_immediately,
        }
    }
}

/// Settings shared by every stream on one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Starting capacity of each message buffer.
    pub initial_capacity: usize,
    /// Largest total size accepted from a peer.
    pub max_message_size: usize,
    /// Full version advertised in every message and checked in the handshake.
    pub version: FullVersion,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            version: FullVersion::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Sending,
    ReceivingHeader,
    ReceivingBody,
}

/// Framed, blocking exchange of whole messages over a duplex byte stream.
///
/// The stream may be a plain socket or an encrypted session; the transport only needs
/// `Read + Write`. Short reads and writes are completed transparently; any error leaves the
/// transport in the state it failed in and must be treated as fatal to the connection.
pub struct Transport<T: Read + Write> {
    stream: T,
    config: TransportConfig,
    state: TransportState,
}

impl<T: Read + Write> fmt::Debug for Transport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<T: Read + Write> Transport<T> {
    pub fn new(stream: T, config: TransportConfig) -> Self {
        Self {
            stream,
            config,
            state: TransportState::Idle,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Creates an empty message sized for this transport.
    pub fn message(&self) -> Result<Message, WireError> {
        Message::with_capacity(self.config.initial_capacity)
    }

    /// Blocks until a whole message has been read into `msg`.
    pub fn read_message(&mut self, msg: &mut Message) -> Result<(), StreamError> {
        msg.clear_for_read();

        self.state = TransportState::ReceivingHeader;
        let prefix = msg.buffer_mut().reserve_bytes(SIZE_PREFIX)?;
        self.stream
            .read_exact(msg.buffer_mut().bytes_mut(prefix, SIZE_PREFIX)?)?;

        let total = msg.buffer().read_u32(prefix)? as usize;
        if total < HEADER_SIZE || total > self.config.max_message_size {
            return Err(WireError::malformed(format!(
                "peer announced a {total} byte message (accepted {HEADER_SIZE}..={})",
                self.config.max_message_size
            ))
            .into());
        }

        self.state = TransportState::ReceivingBody;
        let remaining = total - SIZE_PREFIX;
        let body = msg.buffer_mut().reserve_bytes(remaining)?;
        self.stream
            .read_exact(msg.buffer_mut().bytes_mut(body, remaining)?)?;

        msg.reconstruct_from_bytes()?;
        self.state = TransportState::Idle;
        trace!("read {} message ({total} bytes)", msg.message_type());
        Ok(())
    }

    /// Serializes `msg`, writes it in full and clears it for reuse.
    pub fn write_message(&mut self, msg: &mut Message) -> Result<(), StreamError> {
        msg.set_full_version(self.config.version);

        self.state = TransportState::Sending;
        let message_type = msg.message_type();
        let bytes = msg.serialize()?;
        let total = bytes.len();
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        self.state = TransportState::Idle;

        trace!("wrote {message_type} message ({total} bytes)");
        msg.clear_for_write()?;
        Ok(())
    }

    /// Sends this side's full version and waits for the peer's verdict.
    pub fn initiate_handshake(&mut self, msg: &mut Message) -> Result<FullVersion, StreamError> {
        let local = self.config.version;
        msg.clear_for_write()?;
        msg.set_type(MessageType::HANDSHAKE);
        self.write_message(msg)?;

        self.read_message(msg)?;
        let peer = msg.full_version();
        match msg.message_type() {
            MessageType::HANDSHAKE if peer == local => {
                info!("handshake accepted, protocol {local}");
                Ok(peer)
            }
            MessageType::HANDSHAKE | MessageType::VERSION_INCOMPATIBLE => {
                warn!("handshake rejected: local {local}, peer {peer}");
                Err(StreamError::VersionIncompatible { local, peer })
            }
            found => Err(StreamError::MessageTypeMismatch {
                expected: MessageType::HANDSHAKE,
                found,
            }),
        }
    }

    /// Waits for the peer's full version, compares it with ours and replies.
    pub fn respond_handshake(&mut self, msg: &mut Message) -> Result<FullVersion, StreamError> {
        let local = self.config.version;
        self.read_message(msg)?;

        let found = msg.message_type();
        if found != MessageType::HANDSHAKE {
            return Err(StreamError::MessageTypeMismatch {
                expected: MessageType::HANDSHAKE,
                found,
            });
        }

        let peer = msg.full_version();
        msg.clear_for_write()?;
        if peer != local {
            warn!("rejecting peer version {peer}, local version is {local}");
            msg.set_type(MessageType::VERSION_INCOMPATIBLE);
            self.write_message(msg)?;
            return Err(StreamError::VersionIncompatible { local, peer });
        }

        msg.set_type(MessageType::HANDSHAKE);
        self.write_message(msg)?;
        info!("accepted peer, protocol {peer}");
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};

    use crate::protocol::{ConfigurationFlags, pack, unpack};

    use super::*;

    /// Reads from a fixed script and records everything written.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out at most `chunk` bytes per read call.
    struct Trickle<R> {
        inner: R,
        chunk: usize,
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    impl<R> Write for Trickle<R> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn encoded<A: crate::protocol::PackArgs>(
        config: TransportConfig,
        message_type: MessageType,
        args: A,
    ) -> Vec<u8> {
        let mut transport = Transport::new(Cursor::new(Vec::new()), config);
        let mut msg = transport.message().unwrap();
        msg.set_type(message_type);
        pack(&mut msg, args).unwrap();
        transport.write_message(&mut msg).unwrap();
        transport.into_inner().into_inner()
    }

    #[test]
    fn read_write_message() {
        let stream = Cursor::new(Vec::new());
        let mut transport = Transport::new(stream, TransportConfig::default());

        let mut msg = transport.message().unwrap();
        msg.set_type(MessageType::query(1));
        pack(&mut msg, (-42i32, true)).unwrap();
        transport.write_message(&mut msg).unwrap();
        assert_eq!(msg.count(), 0);

        transport.get_mut().seek(SeekFrom::Start(0)).unwrap();
        transport.read_message(&mut msg).unwrap();
        assert_eq!(transport.state(), TransportState::Idle);
        assert_eq!(msg.message_type(), MessageType::query(1));
        assert_eq!(msg.full_version(), FullVersion::default());
        assert_eq!(unpack::<(i32, bool)>(&msg).unwrap(), (-42, true));
    }

    #[test]
    fn short_reads_are_completed() {
        let bytes = encoded(
            TransportConfig::default(),
            MessageType::COMPILATION_CODE,
            ("complete".to_string(), vec![1u64, 2, 3]),
        );
        let mut transport = Transport::new(
            Trickle {
                inner: Cursor::new(bytes),
                chunk: 2,
            },
            TransportConfig::default(),
        );

        let mut msg = transport.message().unwrap();
        transport.read_message(&mut msg).unwrap();
        let (text, values): (String, Vec<u64>) = unpack(&msg).unwrap();
        assert_eq!(text, "complete");
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn small_buffers_grow_while_reading() {
        let payload = "x".repeat(10_000);
        let bytes = encoded(TransportConfig::default(), MessageType::query(2), (&payload,));
        let config = TransportConfig {
            initial_capacity: 16,
            ..TransportConfig::default()
        };
        let mut transport = Transport::new(Cursor::new(bytes), config);

        let mut msg = transport.message().unwrap();
        transport.read_message(&mut msg).unwrap();
        assert!(msg.buffer().growth_count() > 0);
        assert_eq!(unpack::<(String,)>(&msg).unwrap().0, payload);
    }

    #[test]
    fn truncated_stream_is_a_failure() {
        let mut bytes = encoded(TransportConfig::default(), MessageType::query(1), (7u32,));
        bytes.truncate(bytes.len() - 2);
        let mut transport = Transport::new(Cursor::new(bytes), TransportConfig::default());

        let mut msg = transport.message().unwrap();
        let err = transport.read_message(&mut msg).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Failure {
                retry_immediately: true,
                ..
            }
        ));
        assert_eq!(transport.state(), TransportState::ReceivingBody);
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let config = TransportConfig {
            max_message_size: 64,
            ..TransportConfig::default()
        };
        let mut transport =
            Transport::new(Cursor::new(1024u32.to_le_bytes().to_vec()), config);
        let mut msg = transport.message().unwrap();
        let err = transport.read_message(&mut msg).unwrap_err();
        assert!(matches!(err, StreamError::Wire(WireError::Malformed { .. })));

        let mut transport = Transport::new(
            Cursor::new(4u32.to_le_bytes().to_vec()),
            TransportConfig::default(),
        );
        let err = transport.read_message(&mut msg).unwrap_err();
        assert!(matches!(err, StreamError::Wire(WireError::Malformed { .. })));
    }

    #[test]
    fn handshake_accepts_matching_versions() {
        let config = TransportConfig::default();
        let reply = encoded(config, MessageType::HANDSHAKE, ());
        let mut transport = Transport::new(Duplex::new(reply), config);

        let mut msg = transport.message().unwrap();
        let peer = transport.initiate_handshake(&mut msg).unwrap();
        assert_eq!(peer, config.version);

        // The responder sees exactly what the initiator sent.
        let sent = std::mem::take(&mut transport.get_mut().output);
        let mut responder = Transport::new(Duplex::new(sent), config);
        assert_eq!(responder.respond_handshake(&mut msg).unwrap(), config.version);
        let answer = &responder.get_ref().output;
        assert_eq!(answer, &encoded(config, MessageType::HANDSHAKE, ()));
    }

    #[test]
    fn handshake_rejects_other_protocol_version() {
        let local = TransportConfig::default();
        let peer = TransportConfig {
            version: FullVersion {
                version: local.version.version + 1,
                ..local.version
            },
            ..local
        };

        let hello = encoded(peer, MessageType::HANDSHAKE, ());
        let mut responder = Transport::new(Duplex::new(hello), local);
        let mut msg = responder.message().unwrap();
        let err = responder.respond_handshake(&mut msg).unwrap_err();
        assert!(matches!(err, StreamError::VersionIncompatible { .. }));
        assert!(err.is_session_fatal());

        // The rejection is sent before the error is raised.
        let mut reader =
            Transport::new(Cursor::new(responder.get_ref().output.clone()), peer);
        reader.read_message(&mut msg).unwrap();
        assert_eq!(msg.message_type(), MessageType::VERSION_INCOMPATIBLE);
    }

    #[test]
    fn handshake_rejects_other_configuration() {
        let local = TransportConfig::default();
        let peer = TransportConfig {
            version: FullVersion::current(ConfigurationFlags::default().with_compressed_refs(true)),
            ..local
        };

        let reply = encoded(peer, MessageType::HANDSHAKE, ());
        let mut initiator = Transport::new(Duplex::new(reply), local);
        let mut msg = initiator.message().unwrap();
        let err = initiator.initiate_handshake(&mut msg).unwrap_err();
        assert!(matches!(
            err,
            StreamError::VersionIncompatible { local: l, peer: p }
                if l == local.version && p == peer.version
        ));
    }

    #[test]
    fn handshake_requires_handshake_message() {
        let config = TransportConfig::default();
        let request = encoded(config, MessageType::COMPILATION_REQUEST, (1u32,));
        let mut responder = Transport::new(Duplex::new(request), config);
        let mut msg = responder.message().unwrap();
        let err = responder.respond_handshake(&mut msg).unwrap_err();
        assert!(matches!(
            err,
            StreamError::MessageTypeMismatch {
                expected: MessageType::HANDSHAKE,
                found: MessageType::COMPILATION_REQUEST
            }
        ));
        assert!(responder.get_ref().output.is_empty());
    }

    #[test]
    fn debug_shows_config_and_state() {
        let transport = Transport::new(Cursor::new(vec![0xAAu8; 4]), TransportConfig::default());
        let debug = format!("{transport:?}");
        assert!(debug.starts_with("Transport {"));
        assert!(debug.contains("state: Idle"));
    }

    #[test]
    fn io_errors_map_to_failures() {
        let err: StreamError = io::Error::new(ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(
            err,
            StreamError::Failure {
                retry_immediately: false,
                ..
            }
        ));
        assert!(err.is_connection_fatal());
        assert!(!StreamError::Interrupted.is_connection_fatal());
    }
}
