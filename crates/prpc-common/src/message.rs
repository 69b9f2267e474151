//! Wire message codec.
//!
//! Every frame starts with a fixed 8-byte big-endian head:
//!
//! ```text
//! magic(2) | version(1) | total length(2) | kind/compress flags(1) | seq(2)
//! ```
//!
//! followed by a body which, once inflated, is a MsgPack-encoded
//! `{service_method, payload, error?}` record. The payload itself is encoded
//! with the caller's [`Codec`]. The wrapper always uses MsgPack so that
//! method routing never depends on the payload's serialization choice.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::Codec;
use crate::compress;
use crate::error::{PrpcError, Result};

pub const MAGIC_NUMBER: u16 = 9527;
pub const PROTOCOL_VERSION: u8 = 0xA1;
pub const HEAD_SIZE: usize = 8;
/// Largest frame the 16-bit length field can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

const KIND_MASK: u8 = 0x80;
const COMPRESS_MASK: u8 = 0x08;

const BODY_CODEC: Codec = Codec::MsgPack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// RPC request or response
    Default,
    Heartbeat,
}

/// Fixed-size frame head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head([u8; HEAD_SIZE]);

impl Head {
    pub fn new(kind: MsgKind, seq: u16) -> Self {
        let mut raw = [0u8; HEAD_SIZE];
        raw[0..2].copy_from_slice(&MAGIC_NUMBER.to_be_bytes());
        raw[2] = PROTOCOL_VERSION;
        if kind == MsgKind::Heartbeat {
            raw[5] |= KIND_MASK;
        }
        raw[6..8].copy_from_slice(&seq.to_be_bytes());
        Head(raw)
    }

    /// Validates a head read off the wire.
    ///
    /// # Errors
    ///
    /// - `Magic` / `Version` when the stream does not speak this protocol
    /// - `InvalidLength` when the frame has no body
    pub fn parse(raw: [u8; HEAD_SIZE]) -> Result<Self> {
        let head = Head(raw);
        if head.magic() != MAGIC_NUMBER {
            return Err(PrpcError::Magic(head.magic()));
        }
        if head.version() != PROTOCOL_VERSION {
            return Err(PrpcError::Version(head.version()));
        }
        if head.length() <= HEAD_SIZE {
            return Err(PrpcError::InvalidLength(head.length()));
        }
        Ok(head)
    }

    pub fn magic(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    pub fn version(&self) -> u8 {
        self.0[2]
    }

    /// Total frame length, head included.
    pub fn length(&self) -> usize {
        u16::from_be_bytes([self.0[3], self.0[4]]) as usize
    }

    pub fn kind(&self) -> MsgKind {
        if self.0[5] & KIND_MASK != 0 {
            MsgKind::Heartbeat
        } else {
            MsgKind::Default
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind() == MsgKind::Heartbeat
    }

    pub fn is_compressed(&self) -> bool {
        self.0[5] & COMPRESS_MASK != 0
    }

    pub fn seqno(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }

    pub fn as_bytes(&self) -> &[u8; HEAD_SIZE] {
        &self.0
    }

    fn set_length(&mut self, length: u16) {
        self.0[3..5].copy_from_slice(&length.to_be_bytes());
    }

    fn set_compressed(&mut self) {
        self.0[5] |= COMPRESS_MASK;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RpcBody {
    service_method: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    /// Set by the server when the handler failed; the payload is then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeartbeatBody {
    seqno: u16,
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Message {
    head: Head,
    rpc: Option<RpcBody>,
}

impl Message {
    /// Encodes `value` with `codec`, wraps it with the method name and frames it.
    ///
    /// Produces no output on error.
    ///
    /// # Errors
    ///
    /// - Serialization errors from either encoding step
    /// - `PayloadTooLarge` if the framed message exceeds [`MAX_MESSAGE_SIZE`]
    pub fn pack<T: Serialize + ?Sized>(
        seq: u16,
        service_method: &str,
        value: &T,
        codec: Codec,
    ) -> Result<Vec<u8>> {
        let payload = codec.encode(value)?;
        let body = BODY_CODEC.encode(&RpcBody {
            service_method: service_method.to_string(),
            payload,
            error: None,
        })?;
        frame(Head::new(MsgKind::Default, seq), body)
    }

    /// Frames a failed response for `seq`.
    pub fn pack_error(seq: u16, service_method: &str, error: &str) -> Result<Vec<u8>> {
        let body = BODY_CODEC.encode(&RpcBody {
            service_method: service_method.to_string(),
            payload: Vec::new(),
            error: Some(error.to_string()),
        })?;
        frame(Head::new(MsgKind::Default, seq), body)
    }

    pub fn pack_heartbeat(seq: u16) -> Result<Vec<u8>> {
        let body = BODY_CODEC.encode(&HeartbeatBody { seqno: seq })?;
        frame(Head::new(MsgKind::Heartbeat, seq), body)
    }

    /// Reads exactly one frame from `reader`.
    ///
    /// Blocks only as long as the reader itself does; deadlines are the
    /// caller's business.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; HEAD_SIZE];
        reader.read_exact(&mut raw).await?;
        let head = Head::parse(raw)?;

        let mut body = vec![0u8; head.length() - HEAD_SIZE];
        reader.read_exact(&mut body).await?;
        if head.is_compressed() {
            body = compress::decompress(&body)?;
        }

        let rpc = if head.is_heartbeat() {
            None
        } else {
            Some(BODY_CODEC.decode::<RpcBody>(&body)?)
        };

        Ok(Message { head, rpc })
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn seqno(&self) -> u16 {
        self.head.seqno()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.head.is_heartbeat()
    }

    /// `"Service.Method"` of an RPC frame; empty for heartbeats.
    pub fn service_method(&self) -> &str {
        self.rpc
            .as_ref()
            .map(|rpc| rpc.service_method.as_str())
            .unwrap_or("")
    }

    /// Error reported by the remote handler, if any.
    pub fn remote_error(&self) -> Option<&str> {
        self.rpc.as_ref().and_then(|rpc| rpc.error.as_deref())
    }

    /// Decodes the payload into `T` with the caller's codec.
    ///
    /// # Errors
    ///
    /// - `UnpackHeartbeat` for heartbeat frames
    /// - `EmptyPayload` when there is nothing to decode
    pub fn unpack<T: DeserializeOwned>(&self, codec: Codec) -> Result<T> {
        if self.is_heartbeat() {
            return Err(PrpcError::UnpackHeartbeat);
        }
        let rpc = self.rpc.as_ref().ok_or(PrpcError::EmptyPayload)?;
        if rpc.payload.is_empty() {
            return Err(PrpcError::EmptyPayload);
        }
        codec.decode(&rpc.payload)
    }
}

fn frame(mut head: Head, mut body: Vec<u8>) -> Result<Vec<u8>> {
    if compress::should_compress(body.len()) {
        body = compress::compress(&body)?;
        head.set_compressed();
    }

    let total = HEAD_SIZE + body.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(PrpcError::PayloadTooLarge(total));
    }
    head.set_length(total as u16);

    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(head.as_bytes());
    data.extend_from_slice(&body);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHOD: &str = "Demo.func";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MyRpc {
        text: String,
        integer: i64,
    }

    fn small() -> MyRpc {
        MyRpc {
            text: "hello".to_string(),
            integer: 666,
        }
    }

    fn large() -> MyRpc {
        MyRpc {
            text: "abcdefgh".repeat(1024),
            integer: 888,
        }
    }

    /// Pseudo-random bytes that gzip cannot shrink much.
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_head_layout() {
        let head = Head::new(MsgKind::Default, 0xBEEF);
        assert_eq!(&head.as_bytes()[0..2], &[0x25, 0x37]);
        assert_eq!(head.version(), PROTOCOL_VERSION);
        assert_eq!(head.seqno(), 0xBEEF);
        assert!(!head.is_heartbeat());
        assert!(!head.is_compressed());

        let heartbeat = Head::new(MsgKind::Heartbeat, 1);
        assert_eq!(heartbeat.as_bytes()[5], 0x80);
        assert!(heartbeat.is_heartbeat());
    }

    #[tokio::test]
    async fn test_round_trip_uncompressed() {
        for codec in [Codec::MsgPack, Codec::Json] {
            let data = Message::pack(1, METHOD, &small(), codec).unwrap();
            assert_eq!(
                u16::from_be_bytes([data[3], data[4]]) as usize,
                data.len(),
                "length field covers head and body"
            );

            let msg = Message::read_from(&mut data.as_slice()).await.unwrap();
            assert!(!msg.head().is_compressed());
            assert_eq!(msg.seqno(), 1);
            assert_eq!(msg.service_method(), METHOD);
            assert_eq!(msg.unpack::<MyRpc>(codec).unwrap(), small());
        }
    }

    #[tokio::test]
    async fn test_round_trip_compressed() {
        for codec in [Codec::MsgPack, Codec::Json] {
            let data = Message::pack(42, METHOD, &large(), codec).unwrap();
            assert!(data.len() < 8 * 1024, "repetitive body should shrink");

            let msg = Message::read_from(&mut data.as_slice()).await.unwrap();
            assert!(msg.head().is_compressed());
            assert_eq!(msg.seqno(), 42);
            assert_eq!(msg.service_method(), METHOD);
            assert_eq!(msg.unpack::<MyRpc>(codec).unwrap(), large());
        }
    }

    #[tokio::test]
    async fn test_consecutive_frames_on_one_stream() {
        let mut stream = Message::pack(1, "A.one", &1u32, Codec::MsgPack).unwrap();
        stream.extend(Message::pack_heartbeat(0).unwrap());
        stream.extend(Message::pack(2, "A.two", &large(), Codec::MsgPack).unwrap());

        let mut reader = stream.as_slice();
        let first = Message::read_from(&mut reader).await.unwrap();
        let second = Message::read_from(&mut reader).await.unwrap();
        let third = Message::read_from(&mut reader).await.unwrap();

        assert_eq!(first.unpack::<u32>(Codec::MsgPack).unwrap(), 1);
        assert!(second.is_heartbeat());
        assert_eq!(third.service_method(), "A.two");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_magic_mismatch() {
        let mut data = Message::pack(1, METHOD, &small(), Codec::MsgPack).unwrap();
        data[0] = 0x00;
        let err = Message::read_from(&mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, PrpcError::Magic(_)));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let mut data = Message::pack(1, METHOD, &small(), Codec::MsgPack).unwrap();
        data[2] = 0xA2;
        let err = Message::read_from(&mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, PrpcError::Version(0xA2)));
    }

    #[tokio::test]
    async fn test_invalid_length() {
        let mut data = Message::pack(1, METHOD, &small(), Codec::MsgPack).unwrap();
        data[3] = 0;
        data[4] = HEAD_SIZE as u8;
        let err = Message::read_from(&mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, PrpcError::InvalidLength(8)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let data = Message::pack(1, METHOD, &small(), Codec::MsgPack).unwrap();
        let truncated = &data[..data.len() - 1];
        let err = Message::read_from(&mut &truncated[..]).await.unwrap_err();
        assert!(matches!(err, PrpcError::Io(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_cannot_be_unpacked() {
        let data = Message::pack_heartbeat(7).unwrap();
        let msg = Message::read_from(&mut data.as_slice()).await.unwrap();
        assert!(msg.is_heartbeat());
        assert_eq!(msg.seqno(), 7);
        assert_eq!(msg.service_method(), "");
        assert!(matches!(
            msg.unpack::<MyRpc>(Codec::MsgPack),
            Err(PrpcError::UnpackHeartbeat)
        ));
    }

    #[tokio::test]
    async fn test_error_response() {
        let data = Message::pack_error(9, METHOD, "can't find method func").unwrap();
        let msg = Message::read_from(&mut data.as_slice()).await.unwrap();
        assert_eq!(msg.service_method(), METHOD);
        assert_eq!(msg.remote_error(), Some("can't find method func"));
        assert!(matches!(
            msg.unpack::<MyRpc>(Codec::MsgPack),
            Err(PrpcError::EmptyPayload)
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Message::pack(1, METHOD, &noise(100 * 1024), Codec::MsgPack).unwrap_err();
        assert!(matches!(err, PrpcError::PayloadTooLarge(n) if n > MAX_MESSAGE_SIZE));
    }
}
