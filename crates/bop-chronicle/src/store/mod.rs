//! Memory-mapped storage for a single cycle.
//!
//! A cycle is made of two files:
//!
//! - the **data store**, an append-only sequence of length-prefixed frames
//!   that grows in fixed-size extents, and
//! - the **index block store**, densely packed 8-byte slots holding the byte
//!   offset of each frame.
//!
//! An index slot is written with a release store only after the frame bytes
//! are complete, and tailers read it with an acquire load. That ordering is
//! the whole contract between the writer and every reader.

mod data;
mod extent;
mod index;

pub use data::{DataHeader, DataStore, DataView, Reservation};
pub use extent::MappedExtent;
pub use index::IndexStore;

use crc64fast_nvme::Digest;

/// Size of the header at the start of every data file.
pub const DATA_HEADER_SIZE: u64 = 64;

/// Size of the `[len][checksum]` prefix in front of every payload.
pub const FRAME_HEADER_SIZE: u64 = 8;

/// Frames start on this boundary.
pub const FRAME_ALIGN: u64 = 8;

#[inline]
pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Folded CRC-64/NVME of a payload, as stored in frame headers and sent on the wire.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let mut digest = Digest::new();
    digest.write(payload);
    let value = digest.sum64();
    ((value >> 32) as u32) ^ (value as u32)
}
