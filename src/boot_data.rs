// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Data which the bootloader passes to runtime services, as a list of type-length-value entries.

use crate::status::Error;
use arrayvec::ArrayVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The most boot data which can be kept.
pub const BOOT_DATA_CAPACITY: usize = 0x400;

/// Magic value at the start of valid boot data.
pub const SHARED_DATA_TLV_INFO_MAGIC: u16 = 0x2016;

/// Major type of entries for the partition manager itself.
pub const TLV_MAJOR_CORE: u8 = 0x0;
/// Major type of entries for the initial attestation service.
pub const TLV_MAJOR_IAS: u8 = 0x1;

const HEADER_SIZE: usize = size_of::<TlvHeader>();
const ENTRY_HEADER_SIZE: usize = size_of::<TlvEntry>();

/// The header at the start of the boot data.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TlvHeader {
    pub tlv_magic: u16,
    /// Length of the whole data, including this header.
    pub tlv_tot_len: u16,
}

/// The header of each entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TlvEntry {
    /// The major type in the top 4 bits, the minor type in the rest.
    pub tlv_type: u16,
    /// Length of the entry, including this header.
    pub tlv_len: u16,
}

impl TlvEntry {
    pub fn major(&self) -> u8 {
        (self.tlv_type >> 12) as u8
    }

    pub fn minor(&self) -> u16 {
        self.tlv_type & 0x0fff
    }
}

/// Walks the entries following the header, returning each with its complete bytes.
///
/// Returns `None` for an entry which doesn't fit in `entries`.
fn walk(entries: &[u8]) -> impl Iterator<Item = Option<(TlvEntry, &[u8])>> {
    let mut rest = entries;
    core::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let entry = TlvEntry::read_from_prefix(rest)
            .ok()
            .map(|(entry, _)| entry)
            .filter(|entry| usize::from(entry.tlv_len) >= ENTRY_HEADER_SIZE)
            .filter(|entry| usize::from(entry.tlv_len) <= rest.len());
        match entry {
            Some(entry) => {
                let (bytes, tail) = rest.split_at(entry.tlv_len.into());
                rest = tail;
                Some(Some((entry, bytes)))
            }
            None => {
                rest = &[];
                Some(None)
            }
        }
    })
}

/// The boot data blob, checked when it is stored.
#[derive(Debug, Default)]
pub struct BootData {
    blob: ArrayVec<u8, BOOT_DATA_CAPACITY>,
}

impl BootData {
    pub const fn new() -> Self {
        Self {
            blob: ArrayVec::new_const(),
        }
    }

    /// Stores a new blob, replacing any previous one.
    ///
    /// Only the part covered by the total length in the header is kept.
    pub fn set(&mut self, blob: &[u8]) -> Result<(), Error> {
        let (header, _) = TlvHeader::read_from_prefix(blob).map_err(|_| Error::InvalidParameter)?;
        let total = usize::from(header.tlv_tot_len);
        if header.tlv_magic != SHARED_DATA_TLV_INFO_MAGIC
            || total < HEADER_SIZE
            || total > blob.len()
            || total > BOOT_DATA_CAPACITY
        {
            return Err(Error::InvalidParameter);
        }
        let blob = &blob[..total];
        if walk(&blob[HEADER_SIZE..]).any(|entry| entry.is_none()) {
            return Err(Error::InvalidParameter);
        }
        self.blob.clear();
        self.blob
            .try_extend_from_slice(blob)
            .map_err(|_| Error::InvalidParameter)
    }

    /// Returns whether any boot data has been stored.
    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    /// Iterates over the stored entries with the given major type, with their complete bytes.
    pub fn entries(&self, major: u8) -> impl Iterator<Item = (TlvEntry, &[u8])> {
        walk(self.blob.get(HEADER_SIZE..).unwrap_or_default())
            .flatten()
            .filter(move |(entry, _)| entry.major() == major)
    }

    /// Copies a header followed by all entries with the given major type to `out`.
    ///
    /// Returns the number of bytes written.
    pub fn get(&self, major: u8, out: &mut [u8]) -> Result<usize, Error> {
        if self.is_empty() {
            return Err(Error::NotFound);
        }
        let total = HEADER_SIZE
            + self
                .entries(major)
                .map(|(_, bytes)| bytes.len())
                .sum::<usize>();
        if out.len() < total {
            return Err(Error::InvalidParameter);
        }
        let header = TlvHeader {
            tlv_magic: SHARED_DATA_TLV_INFO_MAGIC,
            // Can't overflow, as the stored blob is shorter.
            tlv_tot_len: total as u16,
        };
        out[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        let mut offset = HEADER_SIZE;
        for (_, bytes) in self.entries(major) {
            out[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn entry(major: u8, minor: u16, payload: &[u8], blob: &mut Vec<u8>) {
        let entry = TlvEntry {
            tlv_type: (u16::from(major) << 12) | minor,
            tlv_len: (ENTRY_HEADER_SIZE + payload.len()) as u16,
        };
        blob.extend_from_slice(entry.as_bytes());
        blob.extend_from_slice(payload);
    }

    /// Builds boot data with two attestation entries around one for the core.
    pub fn sample_blob() -> Vec<u8> {
        let mut entries = Vec::new();
        entry(TLV_MAJOR_IAS, 0x01, &[0xaa; 8], &mut entries);
        entry(TLV_MAJOR_CORE, 0x02, &[0xbb; 3], &mut entries);
        entry(TLV_MAJOR_IAS, 0x03, &[0xcc; 4], &mut entries);
        let header = TlvHeader {
            tlv_magic: SHARED_DATA_TLV_INFO_MAGIC,
            tlv_tot_len: (HEADER_SIZE + entries.len()) as u16,
        };
        let mut blob = header.as_bytes().to_vec();
        blob.extend_from_slice(&entries);
        blob
    }

    #[test]
    fn get_by_major() {
        let mut boot_data = BootData::new();
        boot_data.set(&sample_blob()).unwrap();

        let mut out = [0; 64];
        let len = boot_data.get(TLV_MAJOR_IAS, &mut out).unwrap();
        assert_eq!(len, HEADER_SIZE + 12 + 8);
        let (header, rest) = TlvHeader::read_from_prefix(&out[..len]).unwrap();
        assert_eq!(header.tlv_magic, SHARED_DATA_TLV_INFO_MAGIC);
        assert_eq!(usize::from(header.tlv_tot_len), len);
        let minors: Vec<u16> = walk(rest)
            .map(|entry| entry.unwrap().0.minor())
            .collect();
        assert_eq!(minors, [0x01, 0x03]);

        assert_eq!(boot_data.get(TLV_MAJOR_CORE, &mut out), Ok(HEADER_SIZE + 7));
        assert_eq!(boot_data.get(0x7, &mut out), Ok(HEADER_SIZE));
    }

    #[test]
    fn output_too_small() {
        let mut boot_data = BootData::new();
        boot_data.set(&sample_blob()).unwrap();
        let mut out = [0; 10];
        assert_eq!(
            boot_data.get(TLV_MAJOR_IAS, &mut out),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn nothing_stored() {
        let boot_data = BootData::new();
        let mut out = [0; 16];
        assert_eq!(boot_data.get(TLV_MAJOR_IAS, &mut out), Err(Error::NotFound));
    }

    #[test]
    fn malformed_blobs() {
        let mut boot_data = BootData::new();

        let mut bad_magic = sample_blob();
        bad_magic[0] ^= 0xff;
        assert_eq!(boot_data.set(&bad_magic), Err(Error::InvalidParameter));

        let mut truncated = sample_blob();
        truncated.truncate(truncated.len() - 1);
        assert_eq!(boot_data.set(&truncated), Err(Error::InvalidParameter));

        // An entry claiming to be shorter than its own header.
        let mut zero_length = sample_blob();
        zero_length[HEADER_SIZE + 2] = 0;
        zero_length[HEADER_SIZE + 3] = 0;
        assert_eq!(boot_data.set(&zero_length), Err(Error::InvalidParameter));

        assert_eq!(boot_data.set(&[0x16]), Err(Error::InvalidParameter));
        assert!(boot_data.is_empty());
    }

    #[test]
    fn trailing_bytes_are_dropped() {
        let mut blob = sample_blob();
        let len = blob.len();
        blob.extend_from_slice(&[0xff; 6]);
        let mut boot_data = BootData::new();
        boot_data.set(&blob).unwrap();
        assert_eq!(boot_data.entries(TLV_MAJOR_IAS).count(), 2);
        let mut out = [0; 64];
        let all = boot_data.get(TLV_MAJOR_IAS, &mut out).unwrap()
            + boot_data.get(TLV_MAJOR_CORE, &mut out).unwrap()
            - HEADER_SIZE;
        assert_eq!(all, len);
    }
}
