//! Chunk header used on the WebRTC "disk" data channel.
//!
//! The browser answers a `{"offset":u64,"length":u64}` read request with a
//! binary message carrying this 16-byte little-endian header followed by
//! the requested bytes:
//! ```text
//! [0..8]   offset: u64
//! [8..16]  length: u64
//! [16..]   payload (exactly `length` bytes)
//! ```
//! A single logical read can be satisfied by more than one message; the
//! reader on our side accumulates payload bytes across messages rather than
//! replacing its buffer with the latest one (see `disk_backend::WebRtcBackend`).

pub const DISK_CHUNK_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskChunkHeader {
    pub offset: u64,
    pub length: u64,
}

impl DiskChunkHeader {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn serialize(&self, buf: &mut [u8; DISK_CHUNK_HEADER_SIZE]) {
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
    }

    pub fn serialize_with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; DISK_CHUNK_HEADER_SIZE + payload.len()];
        let mut header_buf = [0u8; DISK_CHUNK_HEADER_SIZE];
        self.serialize(&mut header_buf);
        buf[..DISK_CHUNK_HEADER_SIZE].copy_from_slice(&header_buf);
        buf[DISK_CHUNK_HEADER_SIZE..].copy_from_slice(payload);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, DiskFrameError> {
        if buf.len() < DISK_CHUNK_HEADER_SIZE {
            return Err(DiskFrameError::TooShort(buf.len()));
        }
        Ok(Self {
            offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            length: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }

    /// Split a message into (header, payload), checking the payload is
    /// exactly as long as the header claims.
    pub fn split(buf: &[u8]) -> Result<(Self, &[u8]), DiskFrameError> {
        let header = Self::deserialize(buf)?;
        let payload = &buf[DISK_CHUNK_HEADER_SIZE..];
        if payload.len() as u64 != header.length {
            return Err(DiskFrameError::LengthMismatch {
                declared: header.length,
                actual: payload.len() as u64,
            });
        }
        Ok((header, payload))
    }
}

/// A read request sent to the browser over the "disk" data channel.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct DiskReadRequest {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DiskFrameError {
    #[error("chunk buffer too short: {0} bytes (need at least {DISK_CHUNK_HEADER_SIZE})")]
    TooShort(usize),
    #[error("chunk payload length mismatch: header declared {declared}, got {actual}")]
    LengthMismatch { declared: u64, actual: u64 },
}
