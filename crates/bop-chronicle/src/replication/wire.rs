//! Little-endian framing between a source and its sinks.
//!
//! ```text
//! sink -> source   [u64 resume record number]            (0 = from the start)
//! source -> sink   [u64 record number][u32 len][u32 checksum][payload]
//! heartbeat        [u64::MAX][0][0]
//! ```

use std::io::{self, Read, Write};

use crate::config::RecordNumber;
use crate::error::{ChronicleError, ChronicleResult};
use crate::store::payload_checksum;

/// Record number reserved for heartbeat frames.
pub const HEARTBEAT_RECORD: u64 = u64::MAX;

/// Bytes in front of every payload on the wire.
pub const WIRE_HEADER_LEN: usize = 16;

/// A decoded source frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Heartbeat,
    Record {
        record: RecordNumber,
        payload: Vec<u8>,
    },
}

pub fn write_handshake<W: Write>(writer: &mut W, resume: u64) -> io::Result<()> {
    writer.write_all(&resume.to_le_bytes())?;
    writer.flush()
}

pub fn read_handshake<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_record<W: Write>(
    writer: &mut W,
    record: RecordNumber,
    checksum: u32,
    payload: &[u8],
) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32"))?;
    let mut header = [0u8; WIRE_HEADER_LEN];
    header[0..8].copy_from_slice(&record.as_u64().to_le_bytes());
    header[8..12].copy_from_slice(&len.to_le_bytes());
    header[12..16].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(payload)
}

pub fn write_heartbeat<W: Write>(writer: &mut W) -> io::Result<()> {
    let mut header = [0u8; WIRE_HEADER_LEN];
    header[0..8].copy_from_slice(&HEARTBEAT_RECORD.to_le_bytes());
    writer.write_all(&header)?;
    writer.flush()
}

/// Reads one frame, rejecting payloads above `max_len` and checksum mismatches.
pub fn read_frame<R: Read>(reader: &mut R, max_len: u64) -> ChronicleResult<Frame> {
    let mut header = [0u8; WIRE_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let record = u64::from_le_bytes(header[0..8].try_into().map_err(|_| wire_corrupt())?);
    let len = u32::from_le_bytes(header[8..12].try_into().map_err(|_| wire_corrupt())?);
    let checksum = u32::from_le_bytes(header[12..16].try_into().map_err(|_| wire_corrupt())?);

    if record == HEARTBEAT_RECORD {
        if len != 0 || checksum != 0 {
            return Err(ChronicleError::protocol(format!(
                "heartbeat carries {len} payload bytes"
            )));
        }
        return Ok(Frame::Heartbeat);
    }
    if u64::from(len) > max_len {
        return Err(ChronicleError::protocol(format!(
            "frame of {len} bytes exceeds limit {max_len}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    let actual = payload_checksum(&payload);
    if actual != checksum {
        return Err(ChronicleError::protocol(format!(
            "checksum mismatch for record {record}: expected {checksum:#010x}, got {actual:#010x}"
        )));
    }
    Ok(Frame::Record {
        record: RecordNumber::new(record),
        payload,
    })
}

fn wire_corrupt() -> ChronicleError {
    ChronicleError::protocol("truncated frame header")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn record_frame_decodes() {
        let mut buf = Vec::new();
        let payload = b"payload".to_vec();
        write_record(
            &mut buf,
            RecordNumber::new(77),
            payload_checksum(&payload),
            &payload,
        )
        .expect("write");
        write_heartbeat(&mut buf).expect("heartbeat");

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor, 1024).expect("record"),
            Frame::Record {
                record: RecordNumber::new(77),
                payload
            }
        );
        assert_eq!(read_frame(&mut cursor, 1024).expect("hb"), Frame::Heartbeat);
    }

    #[test]
    fn checksum_mismatch_is_protocol_error() {
        let mut buf = Vec::new();
        write_record(&mut buf, RecordNumber::new(1), 0xdead_beef, b"abc").expect("write");
        assert!(matches!(
            read_frame(&mut Cursor::new(buf), 1024),
            Err(ChronicleError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_reading_payload() {
        let mut buf = Vec::new();
        write_record(&mut buf, RecordNumber::new(1), 0, &[0u8; 64]).expect("write");
        assert!(matches!(
            read_frame(&mut Cursor::new(buf), 16),
            Err(ChronicleError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_stream_is_io_error() {
        let mut buf = Vec::new();
        write_record(&mut buf, RecordNumber::new(1), payload_checksum(b"abc"), b"abc")
            .expect("write");
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            read_frame(&mut Cursor::new(buf), 1024),
            Err(ChronicleError::Io(_))
        ));
    }

    #[test]
    fn handshake_round_trip() {
        let mut buf = Vec::new();
        write_handshake(&mut buf, 12345).expect("write");
        assert_eq!(read_handshake(&mut Cursor::new(buf)).expect("read"), 12345);
    }
}
