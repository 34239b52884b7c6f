//! Streaming package decoder
//!
//! Turns arbitrarily chunked transport reads back into whole packages.

use bytes::{BufMut, BytesMut};

use super::{parse_head, Package, PackageError, PackageResult, PackageType, HEAD_SIZE};

#[derive(Debug, Default)]
enum DecodeState {
    /// Collecting the fixed size head
    #[default]
    ReadingHead,
    /// Collecting exactly `length` body bytes
    ReadingBody {
        package_type: PackageType,
        length: usize,
    },
    /// A framing error was seen; nothing after it can be trusted
    Closed,
}

/// Reassembles packages from a byte stream
///
/// Chunks may contain any number of packages and may end anywhere,
/// including inside the head.
#[derive(Debug)]
pub struct PackageDecoder {
    state: DecodeState,
    head: [u8; HEAD_SIZE],
    head_len: usize,
    body: BytesMut,
}

impl PackageDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingHead,
            head: [0; HEAD_SIZE],
            head_len: 0,
            body: BytesMut::new(),
        }
    }

    /// Feed one chunk and collect every package it completes
    ///
    /// On `InvalidFrameType` the decoder closes; later calls fail with
    /// `DecoderClosed`.
    pub fn feed(&mut self, mut chunk: &[u8]) -> PackageResult<Vec<Package>> {
        let mut packages = Vec::new();

        loop {
            match self.state {
                DecodeState::Closed => return Err(PackageError::DecoderClosed),
                DecodeState::ReadingHead => {
                    if chunk.is_empty() {
                        break;
                    }
                    let take = (HEAD_SIZE - self.head_len).min(chunk.len());
                    self.head[self.head_len..self.head_len + take].copy_from_slice(&chunk[..take]);
                    self.head_len += take;
                    chunk = &chunk[take..];

                    if self.head_len < HEAD_SIZE {
                        break;
                    }

                    let (package_type, length) = match parse_head(&self.head) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            self.state = DecodeState::Closed;
                            return Err(e);
                        }
                    };
                    self.body = BytesMut::with_capacity(length);
                    self.state = DecodeState::ReadingBody {
                        package_type,
                        length,
                    };
                }
                DecodeState::ReadingBody {
                    package_type,
                    length,
                } => {
                    let take = (length - self.body.len()).min(chunk.len());
                    self.body.put_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if self.body.len() < length {
                        break;
                    }

                    let body = std::mem::take(&mut self.body).freeze();
                    packages.push(Package::new(package_type, body));
                    self.head_len = 0;
                    self.state = DecodeState::ReadingHead;
                }
            }
        }

        Ok(packages)
    }

    /// Bytes held for the package currently being assembled
    pub fn buffered(&self) -> usize {
        match self.state {
            DecodeState::ReadingHead => self.head_len,
            DecodeState::ReadingBody { .. } => HEAD_SIZE + self.body.len(),
            DecodeState::Closed => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, DecodeState::Closed)
    }
}

impl Default for PackageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_packages() -> Vec<Package> {
        vec![
            Package::new(PackageType::Handshake, &b"{\"code\":200}"[..]),
            Package::empty(PackageType::HandshakeAck),
            Package::empty(PackageType::Heartbeat),
            Package::new(PackageType::Data, vec![9u8; 300]),
            Package::new(PackageType::Kick, &b"{}"[..]),
        ]
    }

    fn wire(packages: &[Package]) -> Vec<u8> {
        packages
            .iter()
            .flat_map(|p| p.encode().unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_single_chunk_many_packages() {
        let packages = sample_packages();
        let mut decoder = PackageDecoder::new();
        assert_eq!(decoder.feed(&wire(&packages)).unwrap(), packages);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_every_chunk_size() {
        let packages = sample_packages();
        let bytes = wire(&packages);

        for size in 1..=bytes.len() {
            let mut decoder = PackageDecoder::new();
            let mut out = Vec::new();
            for chunk in bytes.chunks(size) {
                out.extend(decoder.feed(chunk).unwrap());
            }
            assert_eq!(out, packages, "chunk size {}", size);
        }
    }

    #[test]
    fn test_every_split_point() {
        let packages = sample_packages();
        let bytes = wire(&packages);

        for split in 0..=bytes.len() {
            let mut decoder = PackageDecoder::new();
            let mut out = decoder.feed(&bytes[..split]).unwrap();
            out.extend(decoder.feed(&bytes[split..]).unwrap());
            assert_eq!(out, packages, "split at {}", split);
        }
    }

    #[test]
    fn test_retains_partial_body() {
        let mut decoder = PackageDecoder::new();
        let head_and_six = [4, 0, 0, 10, 1, 2, 3, 4, 5, 6];

        assert!(decoder.feed(&head_and_six).unwrap().is_empty());
        assert_eq!(decoder.buffered(), 10);

        let out = decoder.feed(&[7, 8, 9, 10]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].package_type, PackageType::Data);
        assert_eq!(out[0].body, Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_empty_chunk() {
        let mut decoder = PackageDecoder::new();
        assert!(decoder.feed(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_type_closes_decoder() {
        let mut decoder = PackageDecoder::new();
        let mut bytes = Package::empty(PackageType::Heartbeat).encode().unwrap().to_vec();
        bytes.extend_from_slice(&[0x42, 0, 0, 0]);

        assert_eq!(decoder.feed(&bytes), Err(PackageError::InvalidFrameType(0x42)));
        assert!(decoder.is_closed());
        assert_eq!(
            decoder.feed(&Package::empty(PackageType::Heartbeat).encode().unwrap()),
            Err(PackageError::DecoderClosed)
        );
    }
}
