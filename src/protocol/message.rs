//! Message envelope carried inside Data packages
//!
//! Layout:
//! - 1 byte flag: `(kind << 1) | compress_route`, bit 4 marks a gzip body
//! - request id as a base-128 varint (Request/Response only)
//! - route as a 2 byte code or 1 byte length + UTF-8 (Request/Notify/Push only)
//! - payload: every remaining byte

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Longest uncompressed route name (one length byte)
pub const MAX_ROUTE_LEN: usize = 255;

/// A u32 id never needs more than 5 varint bytes
const MAX_ID_BYTES: usize = 5;

const FLAG_COMPRESS_ROUTE: u8 = 0x01;
const FLAG_GZIP: u8 = 0x10;
const KIND_MASK: u8 = 0x07;

/// Message errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Short message: not enough bytes for {0}")]
    ShortMessage(&'static str),

    #[error("Route too long: {0} bytes (max: {})", MAX_ROUTE_LEN)]
    RouteTooLong(usize),

    #[error("Invalid message kind: {0}")]
    InvalidMessageKind(u8),

    #[error("Route is not valid UTF-8")]
    InvalidRoute,

    #[error("Message id does not fit in 32 bits")]
    IdOverflow,

    #[error("{0:?} message requires a route")]
    MissingRoute(MessageKind),
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Notify = 1,
    Response = 2,
    Push = 3,
}

impl MessageKind {
    /// Whether the id field is present on the wire
    pub fn has_id(self) -> bool {
        matches!(self, MessageKind::Request | MessageKind::Response)
    }

    /// Whether the route field is present on the wire
    pub fn has_route(self) -> bool {
        matches!(
            self,
            MessageKind::Request | MessageKind::Notify | MessageKind::Push
        )
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Notify),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::Push),
            other => Err(MessageError::InvalidMessageKind(other)),
        }
    }
}

/// A route as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Full route name
    Name(String),
    /// Dictionary code, not yet looked up
    Code(u16),
    /// Dictionary code the local dictionary does not know
    Unresolved(u16),
}

impl Route {
    pub fn name(name: impl Into<String>) -> Self {
        Route::Name(name.into())
    }

    /// The route name, if it is known
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Route::Name(name) => Some(name),
            Route::Code(_) | Route::Unresolved(_) => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Route::Name(_))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Name(name) => f.write_str(name),
            Route::Code(code) => write!(f, "#{}", code),
            Route::Unresolved(code) => write!(f, "#{} (unresolved)", code),
        }
    }
}

impl From<&str> for Route {
    fn from(name: &str) -> Self {
        Route::Name(name.to_string())
    }
}

/// A decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Request id; 0 for Notify and Push
    pub id: u32,
    pub kind: MessageKind,
    /// Present iff `kind.has_route()`
    pub route: Option<Route>,
    /// Gzip flag; carried but never applied here
    pub gzip: bool,
    pub body: Bytes,
}

impl Message {
    pub fn request(id: u32, route: Route, body: impl Into<Bytes>) -> Self {
        Self::with_route(id, MessageKind::Request, route, body)
    }

    pub fn notify(route: Route, body: impl Into<Bytes>) -> Self {
        Self::with_route(0, MessageKind::Notify, route, body)
    }

    pub fn push(route: Route, body: impl Into<Bytes>) -> Self {
        Self::with_route(0, MessageKind::Push, route, body)
    }

    pub fn response(id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: MessageKind::Response,
            route: None,
            gzip: false,
            body: body.into(),
        }
    }

    fn with_route(id: u32, kind: MessageKind, route: Route, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind,
            route: Some(route),
            gzip: false,
            body: body.into(),
        }
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> MessageResult<Bytes> {
        let mut buf = BytesMut::with_capacity(1 + MAX_ID_BYTES + 3 + self.body.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded message to `buf`
    ///
    /// Nothing is written when the route is rejected.
    pub fn encode_into(&self, buf: &mut BytesMut) -> MessageResult<()> {
        let route = if self.kind.has_route() {
            let route = self
                .route
                .as_ref()
                .ok_or(MessageError::MissingRoute(self.kind))?;
            if let Route::Name(name) = route {
                if name.len() > MAX_ROUTE_LEN {
                    return Err(MessageError::RouteTooLong(name.len()));
                }
            }
            Some(route)
        } else {
            None
        };

        let mut flag = (self.kind as u8) << 1;
        if route.map_or(false, Route::is_compressed) {
            flag |= FLAG_COMPRESS_ROUTE;
        }
        if self.gzip {
            flag |= FLAG_GZIP;
        }
        buf.put_u8(flag);

        if self.kind.has_id() {
            put_varint(self.id, buf);
        }

        match route {
            Some(Route::Name(name)) => {
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
            Some(Route::Code(code)) | Some(Route::Unresolved(code)) => buf.put_u16(*code),
            None => {}
        }

        buf.put_slice(&self.body);
        Ok(())
    }

    /// Decode a message from a Data package body
    ///
    /// Compressed routes come back as `Route::Code`; resolving them is
    /// the dictionary's job.
    pub fn decode(data: &[u8]) -> MessageResult<Self> {
        let (&flag, mut rest) = data
            .split_first()
            .ok_or(MessageError::ShortMessage("flag"))?;

        let kind = MessageKind::try_from((flag >> 1) & KIND_MASK)?;
        let compressed = flag & FLAG_COMPRESS_ROUTE != 0;
        let gzip = flag & FLAG_GZIP != 0;

        let id = if kind.has_id() {
            let (id, used) = read_varint(rest)?;
            rest = &rest[used..];
            id
        } else {
            0
        };

        let route = if kind.has_route() {
            if compressed {
                if rest.len() < 2 {
                    return Err(MessageError::ShortMessage("compressed route"));
                }
                let code = u16::from_be_bytes([rest[0], rest[1]]);
                rest = &rest[2..];
                Some(Route::Code(code))
            } else {
                let (&len, tail) = rest
                    .split_first()
                    .ok_or(MessageError::ShortMessage("route length"))?;
                let len = usize::from(len);
                if tail.len() < len {
                    return Err(MessageError::ShortMessage("route"));
                }
                let name = std::str::from_utf8(&tail[..len])
                    .map_err(|_| MessageError::InvalidRoute)?
                    .to_string();
                rest = &tail[len..];
                Some(Route::Name(name))
            }
        } else {
            None
        };

        Ok(Self {
            id,
            kind,
            route,
            gzip,
            body: Bytes::copy_from_slice(rest),
        })
    }
}

/// Little-endian base-128: low 7 bits first, 0x80 on every byte but the last
fn put_varint(mut value: u32, buf: &mut BytesMut) {
    loop {
        let digit = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(digit);
            return;
        }
        buf.put_u8(digit | 0x80);
    }
}

/// Returns the value and the number of bytes consumed
fn read_varint(data: &[u8]) -> MessageResult<(u32, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_ID_BYTES {
            return Err(MessageError::IdOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            let id = u32::try_from(value).map_err(|_| MessageError::IdOverflow)?;
            return Ok((id, i + 1));
        }
    }
    Err(MessageError::ShortMessage("id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        Message::decode(&msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_request_layout() {
        let msg = Message::request(1, Route::name("a.b"), &b"{}"[..]);
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[..], &[0x00, 0x01, 3, b'a', b'.', b'b', b'{', b'}']);
    }

    #[test]
    fn test_varint_digits_little_endian() {
        let msg = Message::response(300, Bytes::new());
        let bytes = msg.encode().unwrap();
        // 300 = 0b10_0101100 -> 0xAC 0x02
        assert_eq!(&bytes[..], &[0x04, 0xAC, 0x02]);
        assert_eq!(roundtrip(&msg).id, 300);
    }

    #[test]
    fn test_kinds_roundtrip() {
        let body = Bytes::from_static(b"{\"data\":\"world1\"}");
        let cases = [
            Message::request(1, Route::name("connector.entryHandler.hello"), body.clone()),
            Message::request(u32::MAX, Route::Code(7), body.clone()),
            Message::notify(Route::name("chat.send"), body.clone()),
            Message::push(Route::Code(0xBEEF), Bytes::new()),
            Message::response(128, body.clone()),
        ];
        for msg in &cases {
            assert_eq!(&roundtrip(msg), msg);
        }
    }

    #[test]
    fn test_field_presence_follows_kind() {
        let notify = Message::notify(Route::name("r"), Bytes::new()).encode().unwrap();
        // flag, route len, route; no id
        assert_eq!(&notify[..], &[0x02, 1, b'r']);

        let response = Message::response(5, &b"x"[..]).encode().unwrap();
        // flag, id, body; no route
        assert_eq!(&response[..], &[0x04, 5, b'x']);
    }

    #[test]
    fn test_compressed_route_is_big_endian() {
        let bytes = Message::push(Route::Code(0x0102), Bytes::new()).encode().unwrap();
        assert_eq!(&bytes[..], &[0x07, 0x01, 0x02]);
        let push = roundtrip(&Message::push(Route::Code(0x0102), Bytes::new()));
        assert_eq!(push.route, Some(Route::Code(0x0102)));
    }

    #[test]
    fn test_gzip_flag_is_carried() {
        let mut msg = Message::notify(Route::name("r"), &b"z"[..]);
        msg.gzip = true;
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], 0x12);
        assert!(roundtrip(&msg).gzip);
    }

    #[test]
    fn test_route_too_long() {
        let long = "r".repeat(MAX_ROUTE_LEN + 1);
        let msg = Message::request(1, Route::name(long), Bytes::new());
        assert_eq!(msg.encode(), Err(MessageError::RouteTooLong(256)));

        let max = "r".repeat(MAX_ROUTE_LEN);
        let msg = Message::request(1, Route::name(max), Bytes::new());
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_missing_route() {
        let msg = Message {
            id: 1,
            kind: MessageKind::Request,
            route: None,
            gzip: false,
            body: Bytes::new(),
        };
        assert_eq!(
            msg.encode(),
            Err(MessageError::MissingRoute(MessageKind::Request))
        );
    }

    #[test]
    fn test_short_messages() {
        assert_eq!(Message::decode(&[]), Err(MessageError::ShortMessage("flag")));
        // Continuation bit still set at the end of the buffer
        assert_eq!(
            Message::decode(&[0x00, 0x81]),
            Err(MessageError::ShortMessage("id"))
        );
        assert_eq!(
            Message::decode(&[0x01, 0x01]),
            Err(MessageError::ShortMessage("compressed route"))
        );
        assert_eq!(
            Message::decode(&[0x02]),
            Err(MessageError::ShortMessage("route length"))
        );
        assert_eq!(
            Message::decode(&[0x02, 4, b'a', b'b']),
            Err(MessageError::ShortMessage("route"))
        );
    }

    #[test]
    fn test_invalid_kind_and_route() {
        assert_eq!(
            Message::decode(&[0x08]),
            Err(MessageError::InvalidMessageKind(4))
        );
        assert_eq!(
            Message::decode(&[0x02, 2, 0xff, 0xfe]),
            Err(MessageError::InvalidRoute)
        );
    }

    #[test]
    fn test_id_overflow() {
        assert_eq!(
            Message::decode(&[0x04, 0xff, 0xff, 0xff, 0xff, 0x7f]),
            Err(MessageError::IdOverflow)
        );
        assert_eq!(
            Message::decode(&[0x04, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(MessageError::IdOverflow)
        );
    }

    #[test]
    fn test_empty_route_and_body() {
        let msg = Message::notify(Route::name(""), Bytes::new());
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.route, Some(Route::name("")));
        assert!(decoded.body.is_empty());
    }
}
