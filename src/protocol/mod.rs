//! Protocol module - Defines the connector wire protocol
//!
//! Two layers:
//! - Packages: 1 byte type, 3 bytes body length (big-endian), body
//! - Messages: flag, optional varint id, optional route, payload;
//!   carried in the body of Data packages

mod body;
mod codec;
mod dict;
mod handshake;
mod message;
mod package;

pub use body::*;
pub use codec::*;
pub use dict::*;
pub use handshake::*;
pub use message::*;
pub use package::*;

/// Package head: type(1) + length(3)
pub const HEAD_SIZE: usize = 4;

/// Largest body a 3 byte length can describe
pub const MAX_BODY_SIZE: usize = 0xFF_FFFF;

/// Version string sent in the client handshake
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Default connector port
pub const DEFAULT_PORT: u16 = 3010;
