//! CASTV2 framing
//!
//! Each message is a big-endian `u32` length followed by a protobuf
//! `CastMessage`. Only string payloads are used, so the message is encoded
//! by hand:
//!
//! | field | name             | wire type |
//! |-------|------------------|-----------|
//! | 1     | protocol_version | varint    |
//! | 2     | source_id        | bytes     |
//! | 3     | destination_id   | bytes     |
//! | 4     | namespace        | bytes     |
//! | 5     | payload_type     | varint    |
//! | 6     | payload_utf8     | bytes     |

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CastError;

/// Largest frame accepted from a device
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const PROTOCOL_VERSION_CASTV2_1_0: u64 = 0;
const PAYLOAD_TYPE_STRING: u64 = 0;

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastFrame {
    pub source_id: String,
    pub destination_id: String,
    pub namespace: String,
    pub payload: String,
}

impl CastFrame {
    pub fn new(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: payload.into(),
        }
    }

    /// Protobuf body without the length prefix
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            16 + self.source_id.len()
                + self.destination_id.len()
                + self.namespace.len()
                + self.payload.len(),
        );
        write_varint_field(&mut out, 1, PROTOCOL_VERSION_CASTV2_1_0);
        write_bytes_field(&mut out, 2, self.source_id.as_bytes());
        write_bytes_field(&mut out, 3, self.destination_id.as_bytes());
        write_bytes_field(&mut out, 4, self.namespace.as_bytes());
        write_varint_field(&mut out, 5, PAYLOAD_TYPE_STRING);
        write_bytes_field(&mut out, 6, self.payload.as_bytes());
        out
    }

    /// Length-prefixed frame
    pub fn encode(&self) -> Result<Vec<u8>, CastError> {
        let body = self.encode_body();
        if body.len() > MAX_FRAME_SIZE {
            return Err(CastError::FrameTooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a protobuf body. Unknown fields are skipped.
    pub fn decode_body(bytes: &[u8]) -> Result<Self, CastError> {
        let mut cursor = 0usize;
        let mut frame = CastFrame::new("", "", "", "");

        while cursor < bytes.len() {
            let key = read_varint(bytes, &mut cursor)
                .ok_or_else(|| CastError::InvalidFrame("truncated field key".into()))?;
            let field = key >> 3;
            match (key & 0x07) as u8 {
                WIRE_VARINT => {
                    read_varint(bytes, &mut cursor)
                        .ok_or_else(|| CastError::InvalidFrame("truncated varint".into()))?;
                }
                WIRE_LEN => {
                    let len = read_varint(bytes, &mut cursor)
                        .ok_or_else(|| CastError::InvalidFrame("truncated length".into()))?
                        as usize;
                    let end = cursor
                        .checked_add(len)
                        .filter(|end| *end <= bytes.len())
                        .ok_or_else(|| CastError::InvalidFrame("field out of bounds".into()))?;
                    let raw = &bytes[cursor..end];
                    cursor = end;

                    let target = match field {
                        2 => &mut frame.source_id,
                        3 => &mut frame.destination_id,
                        4 => &mut frame.namespace,
                        6 => &mut frame.payload,
                        _ => continue,
                    };
                    *target = std::str::from_utf8(raw)
                        .map_err(|_| CastError::InvalidFrame(format!("field {} is not utf-8", field)))?
                        .to_string();
                }
                other => {
                    return Err(CastError::InvalidFrame(format!(
                        "unsupported wire type {}",
                        other
                    )))
                }
            }
        }

        Ok(frame)
    }
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF at a boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<CastFrame>, CastError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CastError::Connect(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CastError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| CastError::InvalidFrame(format!("truncated frame: {}", e)))?;
    CastFrame::decode_body(&body).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &CastFrame) -> Result<(), CastError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| CastError::Connect(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| CastError::Connect(e.to_string()))
}

fn write_varint_field(out: &mut Vec<u8>, field: u64, value: u64) {
    write_varint(out, field << 3 | WIRE_VARINT as u64);
    write_varint(out, value);
}

fn write_bytes_field(out: &mut Vec<u8>, field: u64, value: &[u8]) {
    write_varint(out, field << 3 | WIRE_LEN as u64);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    while shift <= 63 {
        let byte = *bytes.get(*cursor)?;
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}
