use std::borrow::Cow;

use byteorder::{ByteOrder, LittleEndian};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::Error;
use crate::{metagraph::PeerId, tensor::Tensor};

pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame body accepted in either direction, after decompression.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

/// Frame prefix is 8 bits. The first bit says whether the body is
/// zstd-compressed, the second is reserved and the last 6 bits carry the
/// protocol version.
///
/// A frame is `prefix | len (u32 LE) | body`, one frame per stream direction.
pub struct FramePrefix(u8);

impl FramePrefix {
    const COMPRESSED: u8 = 0b1000_0000;
    const VERSION: u8 = 0b0011_1111;

    pub fn new(compressed: bool) -> Self {
        let mut prefix = PROTOCOL_VERSION & Self::VERSION;
        if compressed {
            prefix |= Self::COMPRESSED;
        }
        Self(prefix)
    }

    pub fn compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn version(&self) -> u8 {
        self.0 & Self::VERSION
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl From<u8> for FramePrefix {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

/// A call made by a dendrite to an axon.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum WireRequest {
    /// Run the remote synapse on `payload`.
    Forward {
        source: Option<PeerId>,
        /// Caller's clock, microseconds since the epoch.
        sent_at: i64,
        payload: Tensor,
    },
    /// Feedback on a previous forward.
    Grade {
        source: Option<PeerId>,
        sent_at: i64,
        feedback: Vec<f32>,
    },
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum WireResponse {
    Forward(Tensor),
    Grade(bool),
    Error { code: ErrorCode, message: String },
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum ErrorCode {
    /// No synapse registered, or the axon is shutting down.
    NotServing,
    SynapseFailed,
    /// The synapse didn't answer within the axon's request timeout.
    Timeout,
    BadRequest,
}

impl WireResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// A message that can travel in a frame body.
pub trait WireMessage: Sized {
    fn encode(&self) -> Result<AlignedVec, Error>;
    fn decode(bytes: &[u8]) -> Result<Self, Error>;
}

macro_rules! impl_wire_message {
    ($ty:ty) => {
        impl WireMessage for $ty {
            fn encode(&self) -> Result<AlignedVec, Error> {
                rkyv::to_bytes::<_, 1024>(self)
                    .map_err(|e| Error::CouldNotEncodeMessage(format!("{e:?}")))
            }

            fn decode(bytes: &[u8]) -> Result<Self, Error> {
                // network buffers carry no alignment guarantee
                let mut aligned = AlignedVec::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<$ty>(&aligned)
                    .map_err(|e| Error::CouldNotDecodeMessage(format!("{e:?}")))
            }
        }
    };
}

impl_wire_message!(WireRequest);
impl_wire_message!(WireResponse);

/// Writes one frame. Bodies longer than `compress_threshold` are compressed.
pub async fn write_frame<W, M>(
    writer: &mut W,
    msg: &M,
    compress_threshold: usize,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    M: WireMessage,
{
    let encoded = msg.encode()?;
    let (prefix, body): (FramePrefix, Cow<'_, [u8]>) = if encoded.len() > compress_threshold {
        let compressed = zstd::bulk::compress(&encoded, ZSTD_LEVEL)?;
        (FramePrefix::new(true), Cow::Owned(compressed))
    } else {
        (FramePrefix::new(false), Cow::Borrowed(encoded.as_slice()))
    };
    if body.len() > MAX_FRAME_LEN || encoded.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(encoded.len()));
    }

    let mut buf = Vec::with_capacity(1 + 4 + body.len());
    buf.push(prefix.byte()); // 1 byte
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, body.len() as u32);
    buf.extend_from_slice(&len); // 4 bytes
    buf.extend_from_slice(&body); // len bytes
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads one frame.
pub async fn read_frame<R, M>(reader: &mut R) -> Result<M, Error>
where
    R: AsyncRead + Unpin,
    M: WireMessage,
{
    let mut header = [0u8; 1 + 4];
    reader.read_exact(&mut header).await?;

    let prefix = FramePrefix::from(header[0]);
    if prefix.version() != PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion(prefix.version()));
    }
    let len = LittleEndian::read_u32(&header[1..]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    if prefix.compressed() {
        body = zstd::bulk::decompress(&body, MAX_FRAME_LEN)?;
    }
    M::decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_bits() {
        let plain = FramePrefix::new(false);
        assert!(!plain.compressed());
        assert_eq!(plain.version(), PROTOCOL_VERSION);

        let packed = FramePrefix::new(true);
        assert!(packed.compressed());
        assert_eq!(packed.version(), PROTOCOL_VERSION);
        assert_eq!(packed.byte() & 0b0100_0000, 0);
    }

    #[tokio::test]
    async fn large_payloads_are_compressed_in_transit() {
        let payload = Tensor::new(vec![256, 64], vec![0.5; 256 * 64]).unwrap();
        let request = WireRequest::Forward {
            source: Some(PeerId(7)),
            sent_at: 1_700_000_000_000_000,
            payload,
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &request, 1024).await.unwrap();
        assert!(FramePrefix::from(buf[0]).compressed());
        assert!(buf.len() < 256 * 64 * 4);

        let decoded: WireRequest = read_frame(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let response = WireResponse::error(ErrorCode::NotServing, "no synapse");
        let sent = response.clone();
        let writer = tokio::spawn(async move { write_frame(&mut client, &sent, usize::MAX).await });
        let received: WireResponse = read_frame(&mut server).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(received, response);
    }

    #[tokio::test]
    async fn rejects_other_protocol_versions() {
        let mut frame = Vec::new();
        write_frame(&mut frame, &WireResponse::Grade(true), usize::MAX)
            .await
            .unwrap();
        frame[0] = (frame[0] & !0b0011_1111) | 0b0000_0010;
        let result: Result<WireResponse, _> = read_frame(&mut frame.as_slice()).await;
        assert!(matches!(result, Err(Error::UnsupportedVersion(2))));
    }

    #[tokio::test]
    async fn rejects_oversized_frames_before_reading_them() {
        let mut frame = vec![FramePrefix::new(false).byte()];
        frame.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        let result: Result<WireResponse, _> = read_frame(&mut frame.as_slice()).await;
        assert!(matches!(result, Err(Error::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn garbage_bodies_fail_to_decode() {
        let mut frame = vec![FramePrefix::new(false).byte()];
        frame.extend_from_slice(&3u32.to_le_bytes());
        frame.extend_from_slice(&[0xff, 0xff, 0xff]);
        let result: Result<WireRequest, _> = read_frame(&mut frame.as_slice()).await;
        assert!(matches!(result, Err(Error::CouldNotDecodeMessage(_))));
    }
}
