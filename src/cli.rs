//! Command line options shared by the jitwire binaries.
use clap::Args;

use crate::protocol::{
    ConfigurationFlags, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, FullVersion,
    TransportConfig,
};

/// Transport settings; both peers must agree on the configuration flags.
#[derive(Debug, Clone, Args)]
pub struct TransportArgs {
    /// Advertise compressed object references
    #[arg(long)]
    pub compressed_refs: bool,
    /// Starting size of each message buffer, in bytes
    #[arg(long, default_value_t = DEFAULT_INITIAL_CAPACITY)]
    pub initial_capacity: usize,
    /// Largest message accepted from the peer, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
}

impl TransportArgs {
    pub fn config(&self) -> TransportConfig {
        let flags = ConfigurationFlags::default().with_compressed_refs(self.compressed_refs);
        TransportConfig {
            initial_capacity: self.initial_capacity,
            max_message_size: self.max_message_size,
            version: FullVersion::current(flags),
        }
    }
}

/// Parses bytecode given as hex digits, ignoring whitespace.
pub fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{s}'"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|_| format!("'{byte}' is not a hex byte"))
        })
        .collect()
}
