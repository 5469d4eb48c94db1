pub mod cli;
pub mod diagnostic;
pub mod protocol;

pub use diagnostic::{CompileOutcome, DiagnosticCompiler, compile_remote};
pub use protocol::{ClientStream, CompileServer, Message, StreamError, Transport, TransportConfig};
