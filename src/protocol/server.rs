use std::{
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{info, warn};

use super::{ServerStream, StreamError, ThreadPool, TransportConfig, UnpackArgs, status};

/// The compilation engine behind a [`CompileServer`].
pub trait CompilationHandler: Send + Sync + 'static {
    /// Values of a compilation request, after its sequence number.
    type Request: UnpackArgs;

    /// Compiles one request. Callback queries and the final reply go through `stream`.
    fn compile<S: Read + Write>(
        &self,
        sequence: u32,
        request: Self::Request,
        stream: &mut ServerStream<S>,
    ) -> Result<(), StreamError>;
}

pub struct CompileServer<H: CompilationHandler> {
    listener: TcpListener,
    address: SocketAddr,
    handler: Arc<H>,
    pool: ThreadPool,
    config: TransportConfig,
    shutdown: Arc<AtomicBool>,
}

/// Stops a running [`CompileServer::listen`] loop from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    address: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the accept loop so it sees the flag.
        if let Err(e) = TcpStream::connect(self.address) {
            warn!("failed to wake listener at {}: {e}", self.address);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl<H: CompilationHandler> CompileServer<H> {
    pub fn bind(
        address: impl ToSocketAddrs,
        handler: H,
        workers: usize,
        config: TransportConfig,
    ) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        Ok(Self {
            listener,
            address,
            handler: Arc::new(handler),
            pool: ThreadPool::new(workers),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        let mut address = self.address;
        match address.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => address.set_ip(Ipv4Addr::LOCALHOST.into()),
            IpAddr::V6(ip) if ip.is_unspecified() => address.set_ip(Ipv6Addr::LOCALHOST.into()),
            _ => {}
        }
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            address,
        }
    }

    /// Serves connections until shut down, then waits for open connections to finish.
    pub fn listen(self) -> Result<(), StreamError> {
        info!(
            "listening at {} with {} workers, protocol {}",
            self.address,
            self.pool.size(),
            self.config.version
        );

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let handler = Arc::clone(&self.handler);
                    let config = self.config;
                    self.pool.execute(move || {
                        let peer = stream.peer_addr().ok();
                        match handle_connection(stream, handler.as_ref(), config) {
                            Ok(()) => info!("connection from {peer:?} closed"),
                            Err(e) => warn!("connection from {peer:?} failed: {e}"),
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("listener at {} shutting down", self.address);
        Ok(())
    }
}

fn handle_connection<H: CompilationHandler>(
    stream: TcpStream,
    handler: &H,
    config: TransportConfig,
) -> Result<(), StreamError> {
    stream.set_nodelay(true)?;
    let mut stream = ServerStream::accept(stream, config)?;
    serve(&mut stream, handler)
}

/// Runs requests on an accepted stream until the client leaves.
fn serve<S, H>(stream: &mut ServerStream<S>, handler: &H) -> Result<(), StreamError>
where
    S: Read + Write,
    H: CompilationHandler,
{
    loop {
        let outcome = match stream.read_compile_request::<H::Request>() {
            Ok((sequence, request)) => handler.compile(sequence, request, stream),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {}
            Err(StreamError::Interrupted) => info!("compilation interrupted by client"),
            Err(StreamError::OutOfOrder) => stream.write_error(status::LOST_MESSAGE)?,
            Err(e @ StreamError::MessageTypeMismatch { .. }) => {
                warn!("{e}");
                stream.write_error(status::MESSAGE_TYPE_MISMATCH)?;
            }
            Err(StreamError::ConnectionTerminated) => {
                info!("connection terminated by client");
                return Ok(());
            }
            Err(StreamError::SessionTerminated { client_id }) => {
                info!("session of client {client_id} terminated");
                return Ok(());
            }
            Err(StreamError::Failure {
                reason,
                retry_immediately: true,
            }) => {
                info!("client went away: {reason}");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}
