//! Package (outer frame) encoding
//!
//! Every unit on the wire is a package:
//! - 1 byte package type
//! - 3 bytes body length (big-endian)
//! - Variable length body

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{HEAD_SIZE, MAX_BODY_SIZE};

/// Package errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageError {
    #[error("Short frame: need {needed} bytes, have {available}")]
    ShortFrame { needed: usize, available: usize },

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Package body too large: {0} bytes (max: {})", MAX_BODY_SIZE)]
    BodyTooLarge(usize),

    #[error("Decoder closed after a fatal framing error")]
    DecoderClosed,
}

pub type PackageResult<T> = Result<T, PackageError>;

/// Package type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PackageType {
    Handshake = 1,
    HandshakeAck = 2,
    Heartbeat = 3,
    Data = 4,
    Kick = 5,
}

impl PackageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PackageType {
    type Error = PackageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PackageType::Handshake),
            2 => Ok(PackageType::HandshakeAck),
            3 => Ok(PackageType::Heartbeat),
            4 => Ok(PackageType::Data),
            5 => Ok(PackageType::Kick),
            other => Err(PackageError::InvalidFrameType(other)),
        }
    }
}

/// A decoded package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub package_type: PackageType,
    pub body: Bytes,
}

impl Package {
    pub fn new(package_type: PackageType, body: impl Into<Bytes>) -> Self {
        Self {
            package_type,
            body: body.into(),
        }
    }

    /// A package with no body (heartbeats, handshake acks)
    pub fn empty(package_type: PackageType) -> Self {
        Self::new(package_type, Bytes::new())
    }

    /// Encode this package into a fresh buffer
    pub fn encode(&self) -> PackageResult<Bytes> {
        let mut buf = BytesMut::with_capacity(HEAD_SIZE + self.body.len());
        encode_into(self.package_type, &self.body, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a single package from the start of `data`
    pub fn decode(data: &[u8]) -> PackageResult<Self> {
        if data.len() < HEAD_SIZE {
            return Err(PackageError::ShortFrame {
                needed: HEAD_SIZE,
                available: data.len(),
            });
        }

        let (package_type, length) = parse_head(&data[..HEAD_SIZE])?;
        let needed = HEAD_SIZE + length;
        if data.len() < needed {
            return Err(PackageError::ShortFrame {
                needed,
                available: data.len(),
            });
        }

        Ok(Self::new(
            package_type,
            Bytes::copy_from_slice(&data[HEAD_SIZE..needed]),
        ))
    }
}

/// Append an encoded package to `buf`
pub fn encode_into(
    package_type: PackageType,
    body: &[u8],
    buf: &mut BytesMut,
) -> PackageResult<()> {
    if body.len() > MAX_BODY_SIZE {
        return Err(PackageError::BodyTooLarge(body.len()));
    }

    let len = body.len() as u32;
    buf.reserve(HEAD_SIZE + body.len());
    buf.put_u8(package_type.as_u8());
    buf.put_u8((len >> 16) as u8);
    buf.put_u8((len >> 8) as u8);
    buf.put_u8(len as u8);
    buf.put_slice(body);
    Ok(())
}

/// Read the type and declared body length out of a 4 byte head
pub fn parse_head(head: &[u8]) -> PackageResult<(PackageType, usize)> {
    debug_assert!(head.len() >= HEAD_SIZE);
    let package_type = PackageType::try_from(head[0])?;
    let length = (usize::from(head[1]) << 16) | (usize::from(head[2]) << 8) | usize::from(head[3]);
    Ok((package_type, length))
}
