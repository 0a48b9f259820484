// split-net::codec: envelope framing for the scheduler transport.
//
// Wire format: [u32 big-endian length][bincode(standard) Envelope]
// Oversized frames are rejected before their payload is read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use split_types::config::DEFAULT_MAX_FRAME_BYTES;
use split_types::Envelope;

use crate::error::{NetError, Result};

// ── Codec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self { max_frame_bytes: DEFAULT_MAX_FRAME_BYTES }
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Read the next envelope. `Ok(None)` when the peer closed the stream
    /// between frames.
    pub async fn read_envelope<R>(&self, io: &mut R) -> Result<Option<Envelope>>
    where
        R: AsyncRead + Unpin,
    {
        let Some(buf) = read_length_prefixed(io, self.max_frame_bytes).await? else {
            return Ok(None);
        };
        decode_envelope(&buf).map(Some)
    }

    pub async fn write_envelope<W>(&self, io: &mut W, envelope: &Envelope) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = encode_envelope(envelope)?;
        if buf.len() > self.max_frame_bytes {
            return Err(NetError::FrameTooLarge { len: buf.len(), max: self.max_frame_bytes });
        }
        write_length_prefixed(io, &buf).await
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(envelope, bincode::config::standard())
        .map_err(|e| NetError::Encode(e.to_string()))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| NetError::Decode(e.to_string()))?;
    Ok(envelope)
}

// ── Wire Helpers ──────────────────────────────────────────────────────────────

async fn read_length_prefixed<R>(io: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(NetError::FrameTooLarge { len, max: max_bytes });
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_length_prefixed<W>(io: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len())
        .map_err(|_| NetError::FrameTooLarge { len: data.len(), max: u32::MAX as usize })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use split_types::wire::{StepRequest, StepResult};
    use split_types::{DeviceId, MessageBody, SessionPhase, TensorPayload};

    #[tokio::test]
    async fn step_frame_round_trip() {
        let codec = FrameCodec::default();
        let hidden = TensorPayload::from_f32(vec![4, 8], &[0.25; 32]);
        let env = Envelope::new(
            "sess-001",
            7,
            MessageBody::Step(StepRequest { layer: 3, experts: vec![1, 5], hidden: hidden.clone(), deadline_ms: Some(250) }),
        );

        let mut buf = Vec::new();
        codec.write_envelope(&mut buf, &env).await.unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let decoded = codec.read_envelope(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(decoded.session_id, "sess-001");
        assert_eq!(decoded.seq, 7);
        match decoded.body {
            MessageBody::Step(step) => {
                assert_eq!(step.layer, 3);
                assert_eq!(step.experts, vec![1, 5]);
                assert_eq!(step.hidden, hidden);
            }
            other => panic!("unexpected body {}", other.kind_name()),
        }
    }

    #[tokio::test]
    async fn consecutive_frames_then_eof() {
        let codec = FrameCodec::default();
        let result = StepResult {
            layer: 0,
            device: DeviceId::new("cpu"),
            duration_us: 12,
            step: 1,
            phase: SessionPhase::Prefill,
            hidden: TensorPayload::from_f32(vec![1, 1], &[1.0]),
        };
        let mut buf = Vec::new();
        codec.write_envelope(&mut buf, &Envelope::new("a", 1, MessageBody::StepResult(result.clone()))).await.unwrap();
        codec.write_envelope(&mut buf, &Envelope::new("", 0, MessageBody::StatusQuery)).await.unwrap();

        let mut reader = buf.as_slice();
        let first = codec.read_envelope(&mut reader).await.unwrap().unwrap();
        assert!(matches!(first.body, MessageBody::StepResult(r) if r == result));
        let second = codec.read_envelope(&mut reader).await.unwrap().unwrap();
        assert!(matches!(second.body, MessageBody::StatusQuery));
        assert!(codec.read_envelope(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let codec = FrameCodec::new(16);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 1000]);

        let err = codec.read_envelope(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { len: 1000, max: 16 }));
        assert_eq!(err.kind(), split_types::ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn refuses_to_write_oversized_frame() {
        let codec = FrameCodec::new(64);
        let env = Envelope::new(
            "a",
            1,
            MessageBody::Step(StepRequest {
                layer: 0,
                experts: vec![],
                hidden: TensorPayload::from_f32(vec![64, 1], &[0.0; 64]),
                deadline_ms: None,
            }),
        );
        let mut buf = Vec::new();
        assert!(codec.write_envelope(&mut buf, &env).await.is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = decode_envelope(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, NetError::Decode(_)));
    }
}
