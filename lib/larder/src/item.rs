use crate::clock::RelTime;
use crate::slab::{Chunk, ClassId};
use std::io::Write;

/// Keys are limited to 250 bytes.
pub const KEY_MAX_LENGTH: usize = 250;

/// Upper bound of the formatted ` <flags> <len>\r\n` decoration.
pub const SUFFIX_MAX: usize = 40;

/// Arena slot index; stable for the lifetime of the slot's occupant.
pub type ItemId = usize;

/// A cached record. The metadata lives in the arena slot; the chunk holds
/// key ‖ suffix ‖ value contiguously, where the value includes its trailing
/// CRLF and the suffix is the pre-formatted text-protocol decoration.
///
/// Chunk bytes are written only between allocation and link. Once linked
/// the payload is immutable until the chunk is recycled, which requires the
/// refcount to reach zero first; replies may therefore hold raw references
/// into the chunk for as long as they hold a reference on the item.
pub struct Item {
    pub(crate) chunk: Chunk,
    pub nkey: u8,
    pub nsuffix: u8,
    /// Value length including the trailing CRLF.
    pub nbytes: u32,
    pub flags: u32,
    pub exptime: RelTime,
    /// Last access time, updated by LRU bumps.
    pub time: RelTime,
    pub cas: u64,
    pub refcount: u32,
    pub linked: bool,
    pub clsid: ClassId,
    pub(crate) h_next: Option<ItemId>,
    pub(crate) prev: Option<ItemId>,
    pub(crate) next: Option<ItemId>,
}

/// Accounting overhead charged per item on top of key + suffix + value.
pub const ITEM_HEADER_SIZE: usize = std::mem::size_of::<Item>();

impl Item {
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.chunk[..self.nkey as usize]
    }

    #[inline]
    pub fn suffix(&self) -> &[u8] {
        let start = self.nkey as usize;
        &self.chunk[start..start + self.nsuffix as usize]
    }

    /// Value bytes including the trailing CRLF.
    #[inline]
    pub fn value(&self) -> &[u8] {
        let start = self.nkey as usize + self.nsuffix as usize;
        &self.chunk[start..start + self.nbytes as usize]
    }

    /// Total accounted size of this item.
    #[inline]
    pub fn ntotal(&self) -> usize {
        ITEM_HEADER_SIZE + self.nkey as usize + self.nsuffix as usize + self.nbytes as usize
    }
}

/// An item under construction: the command has been parsed, the key and
/// suffix are in place, and the owning connection is reading the value
/// directly into the chunk. Completion transfers ownership to the store;
/// abandonment must return the chunk to the slab allocator.
pub struct StagedItem {
    pub(crate) chunk: Chunk,
    pub clsid: ClassId,
    pub nkey: u8,
    pub nsuffix: u8,
    pub nbytes: u32,
    pub flags: u32,
    pub exptime: RelTime,
    /// CAS precondition carried by the request (0 = unconditional).
    pub cas_req: u64,
}

impl StagedItem {
    pub(crate) fn build(
        chunk: Chunk,
        clsid: ClassId,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        vlen: usize,
    ) -> StagedItem {
        let mut suffix = [0u8; SUFFIX_MAX];
        let nsuffix = format_suffix(&mut suffix, flags, vlen);

        let mut staged = StagedItem {
            chunk,
            clsid,
            nkey: key.len() as u8,
            nsuffix: nsuffix as u8,
            nbytes: vlen as u32,
            flags,
            exptime,
            cas_req: 0,
        };
        staged.chunk[..key.len()].copy_from_slice(key);
        staged.chunk[key.len()..key.len() + nsuffix].copy_from_slice(&suffix[..nsuffix]);
        staged
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.chunk[..self.nkey as usize]
    }

    #[inline]
    fn value_start(&self) -> usize {
        self.nkey as usize + self.nsuffix as usize
    }

    /// The full value region including the CRLF slot.
    #[inline]
    pub fn value_mut(&mut self) -> &mut [u8] {
        let start = self.value_start();
        let len = self.nbytes as usize;
        &mut self.chunk[start..start + len]
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        let start = self.value_start();
        &self.chunk[start..start + self.nbytes as usize]
    }
}

/// Formats the text-protocol suffix ` <flags> <len>\r\n` into `buf`,
/// returning its length. `vlen` includes the CRLF, which the decoration
/// does not count, matching the length the client declared.
pub fn format_suffix(buf: &mut [u8; SUFFIX_MAX], flags: u32, vlen: usize) -> usize {
    let mut cursor = std::io::Cursor::new(&mut buf[..]);
    write!(cursor, " {} {}\r\n", flags, vlen.saturating_sub(2))
        .expect("suffix exceeds its bound");
    cursor.position() as usize
}

/// Suffix length for a prospective item, used for size classification
/// before any chunk exists.
pub fn suffix_len(flags: u32, vlen: usize) -> usize {
    let mut buf = [0u8; SUFFIX_MAX];
    format_suffix(&mut buf, flags, vlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_suffix() {
        let mut buf = [0u8; SUFFIX_MAX];
        let n = format_suffix(&mut buf, 0, 7);
        assert_eq!(&buf[..n], b" 0 5\r\n");

        let n = format_suffix(&mut buf, 4294967295, 1048578);
        assert_eq!(&buf[..n], b" 4294967295 1048576\r\n");
    }

    #[test]
    fn test_staged_layout() {
        let chunk = vec![0u8; 128].into_boxed_slice();
        let mut staged = StagedItem::build(chunk, 1, b"key", 7, 0, 7);

        assert_eq!(staged.key(), b"key");
        assert_eq!(staged.nsuffix as usize, suffix_len(7, 7));
        staged.value_mut().copy_from_slice(b"hello\r\n");
        assert_eq!(staged.value(), b"hello\r\n");
        assert_eq!(&staged.chunk[..3], b"key");
    }
}
