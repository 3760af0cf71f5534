//! Frame codec for the slice-transfer channel.
//!
//! A frame body is a 4-byte big-endian header length, the JSON header, then
//! raw payload bytes (only `transfer_image` carries any). On a byte stream,
//! `FrameCodec` adds an outer `LengthDelimitedCodec` so frame boundaries
//! survive TCP segmentation.

use std::io;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Message, PartialVolumeDescriptor, TransferId, VolumeSpecifier};

/// Default upper bound for one frame (header + payload).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const HEADER_LENGTH_PREFIX: usize = 4;

/// A frame that could not be turned into a [`Message`].
///
/// Scoped to a single frame: the channel logs it and keeps reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("malformed header: {0}")]
    Malformed(String),

    #[error("{kind} message must not carry a payload ({len} bytes found)")]
    UnexpectedPayload { kind: &'static str, len: usize },
}

const KNOWN_KINDS: &[&str] = &[
    "begin_transfer",
    "set_priority",
    "pause",
    "resume",
    "stop",
    "transfer_image",
];

/// JSON header: every message field except the binary payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Header {
    BeginTransfer {
        transfer_id: TransferId,
        series_uid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_volume_descriptor: Option<PartialVolumeDescriptor>,
    },
    SetPriority {
        transfer_id: TransferId,
        image_indices: Vec<u32>,
        priority: i32,
    },
    Pause {
        transfer_id: TransferId,
    },
    Resume {
        transfer_id: TransferId,
    },
    Stop {
        transfer_id: TransferId,
    },
    TransferImage {
        transfer_id: TransferId,
        image_index: u32,
    },
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    kind: String,
}

fn split(message: &Message) -> (Header, Option<&Bytes>) {
    match message {
        Message::BeginTransfer {
            transfer_id,
            volume,
        } => (
            Header::BeginTransfer {
                transfer_id: *transfer_id,
                series_uid: volume.series_uid.clone(),
                partial_volume_descriptor: volume.partial_volume_descriptor,
            },
            None,
        ),
        Message::SetPriority {
            transfer_id,
            image_indices,
            priority,
        } => (
            Header::SetPriority {
                transfer_id: *transfer_id,
                image_indices: image_indices.clone(),
                priority: *priority,
            },
            None,
        ),
        Message::Pause { transfer_id } => (
            Header::Pause {
                transfer_id: *transfer_id,
            },
            None,
        ),
        Message::Resume { transfer_id } => (
            Header::Resume {
                transfer_id: *transfer_id,
            },
            None,
        ),
        Message::Stop { transfer_id } => (
            Header::Stop {
                transfer_id: *transfer_id,
            },
            None,
        ),
        Message::TransferImage {
            transfer_id,
            image_index,
            payload,
        } => (
            Header::TransferImage {
                transfer_id: *transfer_id,
                image_index: *image_index,
            },
            Some(payload),
        ),
    }
}

fn join(header: Header, payload: Bytes) -> Result<Message, ProtocolError> {
    let message = match header {
        Header::TransferImage {
            transfer_id,
            image_index,
        } => {
            return Ok(Message::TransferImage {
                transfer_id,
                image_index,
                payload,
            });
        }
        Header::BeginTransfer {
            transfer_id,
            series_uid,
            partial_volume_descriptor,
        } => Message::BeginTransfer {
            transfer_id,
            volume: VolumeSpecifier {
                series_uid,
                partial_volume_descriptor,
            },
        },
        Header::SetPriority {
            transfer_id,
            image_indices,
            priority,
        } => Message::SetPriority {
            transfer_id,
            image_indices,
            priority,
        },
        Header::Pause { transfer_id } => Message::Pause { transfer_id },
        Header::Resume { transfer_id } => Message::Resume { transfer_id },
        Header::Stop { transfer_id } => Message::Stop { transfer_id },
    };
    if !payload.is_empty() {
        return Err(ProtocolError::UnexpectedPayload {
            kind: message.kind(),
            len: payload.len(),
        });
    }
    Ok(message)
}

fn parse_header(raw: &[u8]) -> Result<Header, ProtocolError> {
    serde_json::from_slice(raw).map_err(|e| match serde_json::from_slice::<Tagged>(raw) {
        Ok(Tagged { kind }) if !KNOWN_KINDS.contains(&kind.as_str()) => {
            ProtocolError::UnknownKind(kind)
        }
        _ => ProtocolError::Malformed(e.to_string()),
    })
}

/// Encode a message into one frame body.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let (header, payload) = split(message);
    let json = serde_json::to_vec(&header).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let payload_len = payload.map_or(0, Bytes::len);

    let mut frame = BytesMut::with_capacity(HEADER_LENGTH_PREFIX + json.len() + payload_len);
    frame.put_u32(json.len() as u32);
    frame.extend_from_slice(&json);
    if let Some(payload) = payload {
        frame.extend_from_slice(payload);
    }
    Ok(frame.freeze())
}

/// Decode one frame body.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    decode_frame(Bytes::copy_from_slice(frame))
}

/// Decode one frame body without copying the payload.
pub fn decode_frame(mut frame: Bytes) -> Result<Message, ProtocolError> {
    if frame.len() < HEADER_LENGTH_PREFIX {
        return Err(ProtocolError::Truncated {
            needed: HEADER_LENGTH_PREFIX,
            actual: frame.len(),
        });
    }
    let header_len = frame.get_u32() as usize;
    if frame.len() < header_len {
        return Err(ProtocolError::Truncated {
            needed: HEADER_LENGTH_PREFIX + header_len,
            actual: HEADER_LENGTH_PREFIX + frame.len(),
        });
    }
    let header = parse_header(&frame[..header_len])?;
    join(header, frame.split_off(header_len))
}

/// Stream codec: length-delimited frames carrying [`encode`]d messages.
///
/// Decoding yields one `Result` per frame, so a single bad frame is
/// reported without ending the stream. I/O errors and over-long frames do
/// end it.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Message, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(decode_frame(frame.freeze()))),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(
            kind = item.kind(),
            transfer_id = %item.transfer_id(),
            frame_bytes = frame.len(),
            "Encoding frame"
        );
        self.inner.encode(frame, dst)
    }
}
