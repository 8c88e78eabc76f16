use std::io::{self, Read, Write};

use candle_core::{Device, Tensor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

const KIND_HIDDEN: u8 = 1;
const KIND_LOGITS: u8 = 2;
const KIND_RESET: u8 = 3;
const KIND_BARRIER: u8 = 4;
const KIND_STOP: u8 = 5;
const KIND_MESSAGE: u8 = 16;

const MAX_PAYLOAD_LEN: u64 = 1 << 34;

// Payload buffers grow as data arrives, up front we only reserve this much.
const INITIAL_PAYLOAD_CAPACITY: u64 = 1 << 20;

static HIDDEN_TENSOR: &str = "hidden";
static LOGITS_TENSOR: &str = "logits";

#[derive(Debug, Snafu)]
pub enum FrameError {
    #[snafu(display("Peer closed the connection"))]
    Closed,

    #[snafu(display("Cannot read frame"))]
    Read { source: io::Error },

    #[snafu(display("Cannot write frame"))]
    Write { source: io::Error },

    #[snafu(display("Cannot copy tensor to CPU"))]
    CopyTensor { source: candle_core::Error },

    #[snafu(display("Cannot serialize tensor"))]
    SerializeTensor {
        source: safetensors::SafeTensorError,
    },

    #[snafu(display("Cannot deserialize tensor"))]
    DeserializeTensor { source: candle_core::Error },

    #[snafu(display("Frame does not contain tensor `{name}`"))]
    MissingTensor { name: String },

    #[snafu(display("Cannot serialize message"))]
    SerializeMessage { source: serde_json::Error },

    #[snafu(display("Cannot deserialize message"))]
    DeserializeMessage { source: serde_json::Error },

    #[snafu(display("Payload of {len} bytes exceeds the maximum frame size"))]
    PayloadTooLarge { len: u64 },

    #[snafu(display("Frame payload is truncated"))]
    Truncated,

    #[snafu(display("Unknown frame kind: {kind}"))]
    UnknownKind { kind: u8 },

    #[snafu(display("Expected {expected} frame, got frame kind {kind}"))]
    UnexpectedKind { expected: String, kind: u8 },
}

/// Frames that are passed between pipeline ranks.
///
/// A frame is encoded as `[kind: u8][payload length: u64 LE][payload]`.
/// Tensors are encoded as SafeTensors, hidden representations are preceded
/// by their start position as `u64 LE`.
#[derive(Clone, Debug)]
pub enum Frame {
    /// Hidden representations for the next stage.
    Hidden { index_pos: usize, hidden: Tensor },

    /// Logits of the last stage, returned to rank 0.
    Logits { logits: Tensor },

    /// Clear key-value caches.
    Reset,

    /// Synchronize all ranks.
    Barrier,

    /// Stop serving.
    Stop,
}

impl Frame {
    /// Name of the frame kind, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hidden { .. } => "hidden",
            Frame::Logits { .. } => "logits",
            Frame::Reset => "reset",
            Frame::Barrier => "barrier",
            Frame::Stop => "stop",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Frame::Hidden { .. } => KIND_HIDDEN,
            Frame::Logits { .. } => KIND_LOGITS,
            Frame::Reset => KIND_RESET,
            Frame::Barrier => KIND_BARRIER,
            Frame::Stop => KIND_STOP,
        }
    }
}

/// Write a frame and flush the writer.
pub fn write_frame(writer: &mut impl Write, frame: &Frame) -> Result<(), FrameError> {
    let payload = match frame {
        Frame::Hidden { index_pos, hidden } => {
            let mut payload = (*index_pos as u64).to_le_bytes().to_vec();
            payload.extend(serialize_tensor(HIDDEN_TENSOR, hidden)?);
            payload
        }
        Frame::Logits { logits } => serialize_tensor(LOGITS_TENSOR, logits)?,
        Frame::Reset | Frame::Barrier | Frame::Stop => Vec::new(),
    };
    write_raw(writer, frame.kind(), &payload)
}

/// Read a frame.
///
/// Tensors are placed on the CPU.
pub fn read_frame(reader: &mut impl Read) -> Result<Frame, FrameError> {
    let (kind, payload) = read_raw(reader)?;
    match kind {
        KIND_HIDDEN => {
            ensure!(payload.len() >= 8, TruncatedSnafu);
            let (index_pos, tensor) = payload.split_at(8);
            let index_pos = u64::from_le_bytes(index_pos.try_into().map_err(|_| FrameError::Truncated)?);
            Ok(Frame::Hidden {
                index_pos: index_pos as usize,
                hidden: deserialize_tensor(HIDDEN_TENSOR, tensor)?,
            })
        }
        KIND_LOGITS => Ok(Frame::Logits {
            logits: deserialize_tensor(LOGITS_TENSOR, &payload)?,
        }),
        KIND_RESET => Ok(Frame::Reset),
        KIND_BARRIER => Ok(Frame::Barrier),
        KIND_STOP => Ok(Frame::Stop),
        kind => UnknownKindSnafu { kind }.fail(),
    }
}

/// Write a JSON control message and flush the writer.
pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(message).context(SerializeMessageSnafu)?;
    write_raw(writer, KIND_MESSAGE, &payload)
}

/// Read a JSON control message.
pub fn read_message<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, FrameError> {
    let (kind, payload) = read_raw(reader)?;
    ensure!(
        kind == KIND_MESSAGE,
        UnexpectedKindSnafu {
            expected: "message",
            kind
        }
    );
    serde_json::from_slice(&payload).context(DeserializeMessageSnafu)
}

fn write_raw(writer: &mut impl Write, kind: u8, payload: &[u8]) -> Result<(), FrameError> {
    writer.write_all(&[kind]).context(WriteSnafu)?;
    writer
        .write_all(&(payload.len() as u64).to_le_bytes())
        .context(WriteSnafu)?;
    writer.write_all(payload).context(WriteSnafu)?;
    writer.flush().context(WriteSnafu)
}

fn read_raw(reader: &mut impl Read) -> Result<(u8, Vec<u8>), FrameError> {
    let mut kind = [0u8; 1];
    if let Err(err) = reader.read_exact(&mut kind) {
        return match err.kind() {
            io::ErrorKind::UnexpectedEof => ClosedSnafu.fail(),
            _ => Err(err).context(ReadSnafu),
        };
    }

    let mut len = [0u8; 8];
    reader.read_exact(&mut len).context(ReadSnafu)?;
    let len = u64::from_le_bytes(len);
    ensure!(len <= MAX_PAYLOAD_LEN, PayloadTooLargeSnafu { len });

    let mut payload = Vec::with_capacity(len.min(INITIAL_PAYLOAD_CAPACITY) as usize);
    reader.take(len).read_to_end(&mut payload).context(ReadSnafu)?;
    ensure!(payload.len() as u64 == len, TruncatedSnafu);

    Ok((kind[0], payload))
}

fn serialize_tensor(name: &str, tensor: &Tensor) -> Result<Vec<u8>, FrameError> {
    let tensor = tensor
        .to_device(&Device::Cpu)
        .and_then(|tensor| tensor.contiguous())
        .context(CopyTensorSnafu)?;
    safetensors::tensor::serialize([(name, &tensor)], &None).context(SerializeTensorSnafu)
}

fn deserialize_tensor(name: &str, data: &[u8]) -> Result<Tensor, FrameError> {
    let mut tensors =
        candle_core::safetensors::load_buffer(data, &Device::Cpu).context(DeserializeTensorSnafu)?;
    tensors.remove(name).context(MissingTensorSnafu { name })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use candle_core::{DType, Device, Tensor};
    use serde::{Deserialize, Serialize};

    use super::{read_frame, read_message, write_frame, write_message, Frame, FrameError};
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn hidden_frames_keep_position_and_dtype() {
        let hidden = Tensor::arange(0f32, 12., &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 4))
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();

        let mut buffer = Vec::new();
        write_frame(
            &mut buffer,
            &Frame::Hidden {
                index_pos: 7,
                hidden: hidden.clone(),
            },
        )
        .unwrap();
        assert_eq!(buffer[0], 1);

        match read_frame(&mut Cursor::new(buffer)).unwrap() {
            Frame::Hidden {
                index_pos,
                hidden: decoded,
            } => {
                assert_eq!(index_pos, 7);
                assert_eq!(decoded.dtype(), DType::F16);
                assert_tensor_eq::<f32>(
                    decoded.to_dtype(DType::F32).unwrap(),
                    hidden.to_dtype(DType::F32).unwrap(),
                    0.,
                );
            }
            frame => panic!("unexpected frame: {}", frame.name()),
        }
    }

    #[test]
    fn control_frames_have_empty_payload() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Frame::Stop).unwrap();
        assert_eq!(buffer, vec![5, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            read_frame(&mut Cursor::new(buffer)).unwrap(),
            Frame::Stop
        ));
    }

    #[test]
    fn frames_follow_each_other() {
        let logits = Tensor::new(&[[0.5f32, -1.5]], &Device::Cpu).unwrap();
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Frame::Reset).unwrap();
        write_frame(&mut buffer, &Frame::Logits { logits }).unwrap();

        let mut reader = Cursor::new(buffer);
        assert!(matches!(read_frame(&mut reader).unwrap(), Frame::Reset));
        assert!(matches!(
            read_frame(&mut reader).unwrap(),
            Frame::Logits { .. }
        ));
        assert!(matches!(read_frame(&mut reader), Err(FrameError::Closed)));
    }

    #[test]
    fn messages_are_not_frames() {
        #[derive(Debug, Deserialize, PartialEq, Serialize)]
        struct Hello {
            rank: usize,
        }

        let mut buffer = Vec::new();
        write_message(&mut buffer, &Hello { rank: 3 }).unwrap();
        assert_eq!(
            read_message::<Hello>(&mut Cursor::new(buffer.clone())).unwrap(),
            Hello { rank: 3 }
        );
        assert!(matches!(
            read_frame(&mut Cursor::new(buffer)),
            Err(FrameError::UnknownKind { kind: 16 })
        ));
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let mut buffer = vec![1u8];
        buffer.extend(u64::MAX.to_le_bytes());
        assert!(matches!(
            read_frame(&mut Cursor::new(buffer)),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn short_payloads_are_truncated() {
        // The length is within bounds, but only three bytes follow.
        let mut buffer = vec![1u8];
        buffer.extend((1u64 << 33).to_le_bytes());
        buffer.extend([0u8; 3]);
        assert!(matches!(
            read_frame(&mut Cursor::new(buffer)),
            Err(FrameError::Truncated)
        ));
    }
}
