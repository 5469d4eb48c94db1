//! Diagnostic compilation engine.
//!
//! Stands in for a real compiler so both ends of the protocol can be exercised: the server
//! resolves the method through one callback query, then "compiles" the bytecode by prefixing
//! it with the optimization level. The client side answers the query with a caller-supplied
//! resolver.
use std::io::{Read, Write};

use log::{debug, info};

use crate::protocol::{
    Bytes, ClientStream, CompilationHandler, Handle, MessageType, ServerStream, StreamError,
    status,
};

/// Callback query asking the client for the handle of a method, by signature.
pub const RESOLVE_METHOD: MessageType = MessageType::query(1);

/// Method signature, bytecode and optimization level.
pub type CompileRequest = (String, Bytes, u32);

#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticCompiler;

impl CompilationHandler for DiagnosticCompiler {
    type Request = CompileRequest;

    fn compile<S: Read + Write>(
        &self,
        sequence: u32,
        (signature, bytecode, opt_level): CompileRequest,
        stream: &mut ServerStream<S>,
    ) -> Result<(), StreamError> {
        info!(
            "request #{sequence}: {signature} ({} bytes at level {opt_level})",
            bytecode.0.len()
        );

        stream.write(RESOLVE_METHOD, (&signature,))?;
        let (method,): (Handle,) = stream.read()?;
        debug!("{signature} resolved to {:#x}", method.0);

        match emit(&bytecode, opt_level) {
            Some(code) => stream.finish_compilation((code, method)),
            None => stream.write_error(status::COMPILATION_FAILED),
        }
    }
}

fn emit(bytecode: &Bytes, opt_level: u32) -> Option<Bytes> {
    if bytecode.0.is_empty() {
        return None;
    }
    let level = u8::try_from(opt_level).ok()?;
    let mut code = Vec::with_capacity(bytecode.0.len() + 1);
    code.push(level);
    code.extend_from_slice(&bytecode.0);
    Some(Bytes(code))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled { code: Bytes, method: Handle },
    Failed { status: u32 },
    /// The resolver could not answer and the client interrupted the compilation.
    Abandoned,
}

/// Sends one compilation request and serves the server's queries until it answers.
pub fn compile_remote<T, F>(
    client: &mut ClientStream<T>,
    signature: &str,
    bytecode: &[u8],
    opt_level: u32,
    mut resolve: F,
) -> Result<CompileOutcome, StreamError>
where
    T: Read + Write,
    F: FnMut(&str) -> Option<Handle>,
{
    client.build_compile_request((signature, Bytes(bytecode.to_vec()), opt_level))?;

    loop {
        match client.read_message_type()? {
            RESOLVE_METHOD => {
                let (name,): (String,) = client.get_recv_data()?;
                match resolve(&name) {
                    Some(handle) => client.write(RESOLVE_METHOD, (handle,))?,
                    None => {
                        client.write_error(MessageType::COMPILATION_INTERRUPTED, 0)?;
                        return Ok(CompileOutcome::Abandoned);
                    }
                }
            }
            MessageType::COMPILATION_CODE => {
                let (code, method) = client.get_recv_data()?;
                return Ok(CompileOutcome::Compiled { code, method });
            }
            MessageType::COMPILATION_FAILURE => {
                let (status,) = client.get_recv_data()?;
                return Ok(CompileOutcome::Failed { status });
            }
            found => {
                return Err(StreamError::MessageTypeMismatch {
                    expected: MessageType::COMPILATION_CODE,
                    found,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_prefixes_level() {
        assert_eq!(
            emit(&Bytes(vec![0x2a, 0xac]), 2),
            Some(Bytes(vec![2, 0x2a, 0xac]))
        );
        assert_eq!(emit(&Bytes(Vec::new()), 2), None);
        assert_eq!(emit(&Bytes(vec![1]), 300), None);
    }
}
