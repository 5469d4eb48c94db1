//! Role-specific conversations over a [`Transport`].
//!
//! A client opens a connection, sends compilation requests and answers the callback queries
//! the server sends while compiling. A server accepts connections, reads requests and replies
//! with either code or a failure status. Both sides run the handshake before anything else.
use std::{
    fmt,
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
};

use log::{debug, info};

use super::{
    FullVersion, Message, MessageType, PackArgs, StreamError, Transport, TransportConfig, Unpack,
    UnpackArgs, pack, unpack,
};

/// Status codes carried by `COMPILATION_FAILURE` messages.
pub mod status {
    /// The handler gave up on the request.
    pub const COMPILATION_FAILED: u32 = 1;
    pub const STREAM_FAILURE: u32 = 49;
    /// A request arrived with a stale sequence number; the client may resend it.
    pub const LOST_MESSAGE: u32 = 50;
    pub const MESSAGE_TYPE_MISMATCH: u32 = 51;
    pub const VERSION_INCOMPATIBLE: u32 = 52;
    pub const INTERRUPTED: u32 = 53;
}

/// Separate buffers for the two directions, so a received message stays readable while a
/// reply is being built.
struct Exchange<T: Read + Write> {
    transport: Transport<T>,
    send: Message,
    recv: Message,
    peer: FullVersion,
}

impl<T: Read + Write> Exchange<T> {
    fn new(stream: T, config: TransportConfig) -> Result<Self, StreamError> {
        let transport = Transport::new(stream, config);
        Ok(Self {
            send: transport.message()?,
            recv: transport.message()?,
            transport,
            peer: config.version,
        })
    }

    fn write<A: PackArgs>(
        &mut self,
        message_type: MessageType,
        args: A,
    ) -> Result<(), StreamError> {
        self.send.clear_for_write()?;
        self.send.set_type(message_type);
        pack(&mut self.send, args)?;
        self.transport.write_message(&mut self.send)
    }

    fn read(&mut self) -> Result<MessageType, StreamError> {
        self.transport.read_message(&mut self.recv)?;
        Ok(self.recv.message_type())
    }
}

impl<T: Read + Write> fmt::Debug for Exchange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("transport", &self.transport)
            .field("peer", &self.peer)
            .field("send", &self.send)
            .field("recv", &self.recv)
            .finish()
    }
}

pub struct ClientStream<T: Read + Write> {
    exchange: Exchange<T>,
    next_sequence: u32,
}

impl ClientStream<TcpStream> {
    pub fn connect_tcp(
        address: impl ToSocketAddrs,
        config: TransportConfig,
    ) -> Result<Self, StreamError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        Self::connect(stream, config)
    }
}

impl<T: Read + Write> ClientStream<T> {
    /// Runs the handshake as initiator over an established byte stream.
    pub fn connect(stream: T, config: TransportConfig) -> Result<Self, StreamError> {
        let mut exchange = Exchange::new(stream, config)?;
        exchange.peer = exchange.transport.initiate_handshake(&mut exchange.recv)?;
        Ok(Self {
            exchange,
            next_sequence: 0,
        })
    }

    pub fn peer_version(&self) -> FullVersion {
        self.exchange.peer
    }

    pub fn transport(&self) -> &Transport<T> {
        &self.exchange.transport
    }

    /// Sends a compilation request and returns the sequence number it was tagged with.
    pub fn build_compile_request<A: PackArgs>(&mut self, args: A) -> Result<u32, StreamError> {
        let sequence = self.next_sequence;
        let send = &mut self.exchange.send;
        send.clear_for_write()?;
        send.set_type(MessageType::COMPILATION_REQUEST);
        send.push(&sequence)?;
        pack(send, args)?;
        self.exchange.transport.write_message(send)?;

        self.next_sequence = self.next_sequence.wrapping_add(1);
        debug!("sent compilation request #{sequence}");
        Ok(sequence)
    }

    pub fn write<A: PackArgs>(
        &mut self,
        message_type: MessageType,
        args: A,
    ) -> Result<(), StreamError> {
        self.exchange.write(message_type, args)
    }

    /// Sends `message_type` carrying a single status code, e.g. to interrupt a compilation.
    pub fn write_error(
        &mut self,
        message_type: MessageType,
        code: u32,
    ) -> Result<(), StreamError> {
        self.exchange.write(message_type, (code,))
    }

    /// Reads the next message and returns its tag; its values stay available through
    /// [`get_recv_data`](Self::get_recv_data) until the next read.
    pub fn read_message_type(&mut self) -> Result<MessageType, StreamError> {
        match self.exchange.read()? {
            MessageType::COMPILATION_INTERRUPTED => Err(StreamError::Interrupted),
            MessageType::CONNECTION_TERMINATE => Err(StreamError::ConnectionTerminated),
            found => Ok(found),
        }
    }

    pub fn get_recv_data<A: UnpackArgs>(&self) -> Result<A, StreamError> {
        Ok(unpack(&self.exchange.recv)?)
    }

    /// Reads the next message, which must be tagged `expected`, and unpacks its values.
    pub fn read<A: UnpackArgs>(&mut self, expected: MessageType) -> Result<A, StreamError> {
        let found = self.read_message_type()?;
        if found != expected {
            return Err(StreamError::MessageTypeMismatch { expected, found });
        }
        self.get_recv_data()
    }

    /// Asks the server to drop this connection.
    pub fn terminate_connection(&mut self) -> Result<(), StreamError> {
        info!("terminating connection");
        self.exchange.write(MessageType::CONNECTION_TERMINATE, ())
    }

    /// Tells the server that every connection of `client_id` is done.
    pub fn terminate_session(&mut self, client_id: u64) -> Result<(), StreamError> {
        info!("terminating session of client {client_id}");
        self.exchange
            .write(MessageType::CLIENT_SESSION_TERMINATE, (client_id,))
    }
}

impl<T: Read + Write> fmt::Debug for ClientStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("exchange", &self.exchange)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

pub struct ServerStream<T: Read + Write> {
    exchange: Exchange<T>,
    expected_sequence: u32,
    last_sent: MessageType,
}

impl<T: Read + Write> ServerStream<T> {
    /// Runs the handshake as responder over a freshly accepted byte stream.
    pub fn accept(stream: T, config: TransportConfig) -> Result<Self, StreamError> {
        let mut exchange = Exchange::new(stream, config)?;
        exchange.peer = exchange.transport.respond_handshake(&mut exchange.recv)?;
        Ok(Self {
            exchange,
            expected_sequence: 0,
            last_sent: MessageType::default(),
        })
    }

    pub fn peer_version(&self) -> FullVersion {
        self.exchange.peer
    }

    pub fn transport(&self) -> &Transport<T> {
        &self.exchange.transport
    }

    /// Waits for the next compilation request and returns its sequence number and values.
    pub fn read_compile_request<A: UnpackArgs>(&mut self) -> Result<(u32, A), StreamError> {
        match self.exchange.read()? {
            MessageType::COMPILATION_REQUEST => {}
            MessageType::CONNECTION_TERMINATE => return Err(StreamError::ConnectionTerminated),
            MessageType::CLIENT_SESSION_TERMINATE => {
                let (client_id,) = unpack::<(u64,)>(&self.exchange.recv)?;
                return Err(StreamError::SessionTerminated { client_id });
            }
            found => {
                return Err(StreamError::MessageTypeMismatch {
                    expected: MessageType::COMPILATION_REQUEST,
                    found,
                });
            }
        }

        let recv = &self.exchange.recv;
        let sequence = u32::unpack(recv.data_point(0)?)?;
        let args = A::unpack_args_at(recv, 1)?;
        self.check_sequence(sequence)?;
        Ok((sequence, args))
    }

    /// Accepts `sequence` unless an equal or later request was already taken.
    pub fn check_sequence(&mut self, sequence: u32) -> Result<(), StreamError> {
        if sequence < self.expected_sequence {
            info!(
                "discarding request #{sequence}, expected #{}",
                self.expected_sequence
            );
            return Err(StreamError::OutOfOrder);
        }
        self.expected_sequence = sequence.wrapping_add(1);
        Ok(())
    }

    /// Sends a callback query; the client's reply is read with [`read`](Self::read).
    pub fn write<A: PackArgs>(
        &mut self,
        message_type: MessageType,
        args: A,
    ) -> Result<(), StreamError> {
        self.exchange.write(message_type, args)?;
        self.last_sent = message_type;
        Ok(())
    }

    /// Reads the client's reply to the last query sent.
    pub fn read<A: UnpackArgs>(&mut self) -> Result<A, StreamError> {
        let expected = self.last_sent;
        match self.exchange.read()? {
            found if found == expected => Ok(unpack(&self.exchange.recv)?),
            MessageType::COMPILATION_INTERRUPTED => Err(StreamError::Interrupted),
            found => Err(StreamError::MessageTypeMismatch { expected, found }),
        }
    }

    pub fn finish_compilation<A: PackArgs>(&mut self, args: A) -> Result<(), StreamError> {
        self.write(MessageType::COMPILATION_CODE, args)
    }

    pub fn write_error(&mut self, code: u32) -> Result<(), StreamError> {
        self.write(MessageType::COMPILATION_FAILURE, (code,))
    }
}

impl<T: Read + Write> fmt::Debug for ServerStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStream")
            .field("exchange", &self.exchange)
            .field("expected_sequence", &self.expected_sequence)
            .field("last_sent", &self.last_sent)
            .finish()
    }
}
