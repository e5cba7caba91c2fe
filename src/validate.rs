//! Classification of externally supplied payload pointers.
//!
//! `free` and `reallocate` take raw pointers from the caller; everything
//! about them is suspect until proven otherwise.  The checks lean on the
//! masked boundary words: a pointer into the middle of caller data reads
//! back a word that almost never unmasks to a plausible block.

use core::fmt;

use crate::block::{BlockView, ALIGN_SIZE, MIN_BLOCK_SIZE, ROW_SIZE};

/// Why a payload pointer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerError {
    Null,
    Misaligned,
    /// The derived block size is below the minimum or not a multiple of
    /// the alignment unit.
    BadSize,
    /// The derived block does not lie between prologue and epilogue.
    OutOfRange,
    NotAllocated,
    InQuickList,
    /// The block claims a free predecessor whose footer is absent or
    /// does not match the predecessor's header.
    BadPredecessor,
}

impl fmt::Display for PointerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null pointer"),
            Self::Misaligned => write!(f, "misaligned pointer"),
            Self::BadSize => write!(f, "implausible block size"),
            Self::OutOfRange => write!(f, "block bounds outside the managed region"),
            Self::NotAllocated => write!(f, "block is not allocated"),
            Self::InQuickList => write!(f, "block is parked in a quick list"),
            Self::BadPredecessor => write!(f, "inconsistent predecessor footer"),
        }
    }
}

/// Check that `p` is the payload pointer of a live allocated block and
/// return the block's offset.
pub(crate) fn payload_block(v: &BlockView, p: *mut u8) -> Result<usize, PointerError> {
    if p.is_null() {
        return Err(PointerError::Null);
    }
    let addr = p as usize;
    if addr % ALIGN_SIZE != 0 {
        return Err(PointerError::Misaligned);
    }
    // The earliest legal payload sits one block past the prologue; the
    // latest header row must still be inside the region.
    let base = v.base() as usize;
    if addr < base + MIN_BLOCK_SIZE + 2 * ROW_SIZE || addr >= base + v.len() {
        return Err(PointerError::OutOfRange);
    }
    let b = addr - base - 2 * ROW_SIZE;
    let header = v.header(b);
    let size = header.block_size();
    if size < MIN_BLOCK_SIZE || size % ALIGN_SIZE != 0 {
        return Err(PointerError::BadSize);
    }
    let epilogue = v.len() - ALIGN_SIZE;
    if b + size > epilogue {
        return Err(PointerError::OutOfRange);
    }
    if header.in_quick() {
        return Err(PointerError::InQuickList);
    }
    if !header.allocated() {
        return Err(PointerError::NotAllocated);
    }
    if !header.prev_allocated() {
        let footer = v.prev_footer(b);
        let prev_size = footer.block_size();
        if footer.allocated()
            || prev_size < MIN_BLOCK_SIZE
            || prev_size % ALIGN_SIZE != 0
            || prev_size > b - MIN_BLOCK_SIZE
        {
            return Err(PointerError::BadPredecessor);
        }
        if v.header(b - prev_size).raw() != footer.raw() {
            return Err(PointerError::BadPredecessor);
        }
    }
    Ok(b)
}
