//! Wire framing: text JSON by default, a length-prefixed binary frame
//! after the two-phase `protocol.set_binary` switch.
//!
//! Binary layout: `[kind:u8][flags:u8][length:u32 BE][payload]`, where the
//! payload is the JSON envelope and flags bit 0 marks zlib compression.
//! Payloads under the threshold stay uncompressed — the CPU cost is not
//! worth it for small frames.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use agentmesh_core::error::{Error, GatewayError, Result};
use agentmesh_core::message::Message;

/// Frame kind for a message envelope.
pub const KIND_MESSAGE: u8 = 1;

/// Flags bit 0: payload is zlib-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Frame header size: kind + flags + u32 length.
const HEADER_LEN: usize = 6;

/// Encode a message as text JSON (the default wire form).
pub fn encode_text(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a text frame.
pub fn decode_text(raw: &str) -> Result<Message> {
    Ok(serde_json::from_str(raw)?)
}

/// Binary codec with a compression threshold.
#[derive(Debug, Clone, Copy)]
pub struct BinaryCodec {
    pub threshold: usize,
}

impl BinaryCodec {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(message)?;

        let (flags, payload) = if payload.len() >= self.threshold {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&payload)
                .and_then(|()| encoder.finish())
                .map(|compressed| (FLAG_COMPRESSED, compressed))
                .map_err(|e| Error::Internal(format!("compression failed: {e}")))?
        } else {
            (0u8, payload)
        };

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(KIND_MESSAGE);
        frame.push(flags);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message> {
        if bytes.len() < HEADER_LEN {
            return Err(GatewayError::InvalidParams("binary frame too short".into()).into());
        }
        if bytes[0] != KIND_MESSAGE {
            return Err(
                GatewayError::InvalidParams(format!("unknown frame kind: {}", bytes[0])).into(),
            );
        }

        let flags = bytes[1];
        let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != declared {
            return Err(GatewayError::InvalidParams(format!(
                "frame length mismatch: declared {declared}, got {}",
                payload.len()
            ))
            .into());
        }

        let json: Vec<u8> = if flags & FLAG_COMPRESSED != 0 {
            let mut decoder = ZlibDecoder::new(payload);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| GatewayError::InvalidParams(format!("decompression failed: {e}")))?;
            out
        } else {
            payload.to_vec()
        };

        Ok(serde_json::from_slice(&json)?)
    }
}
