//! The allocator core: bootstrap, request dispatch, splitting, eager
//! coalescing, heap growth, and the utilization metrics.
//!
//! A [`Heap`] owns its page source, the free-list table, and the quick
//! lists; every entry point takes `&mut self` and the design is
//! deliberately unsynchronized.  Allocation tries the quick lists, then
//! a first-fit search of the size classes, then grows the region one
//! page at a time until the free tail can hold the request.

use core::fmt;
use core::ptr::{self, NonNull};

use crate::block::{
    block_size_for, BlockView, Header, ALIGN_SIZE, DEFAULT_MASK, MAX_PAYLOAD_SIZE, MIN_BLOCK_SIZE,
};
use crate::freelist::{class_of, FreeLists, NUM_FREE_LISTS};
use crate::quicklist::{index_for, size_at, QuickList, NUM_QUICK_LISTS};
use crate::region::{PageSource, PAGE_SIZE};
use crate::validate::payload_block;

/// Errors reported by the allocation entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The request cannot be represented: an oversize allocation, or a
    /// reallocate of a pointer that fails validation.
    BadSize,
    /// The page source is exhausted.
    OutOfMemory,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSize => write!(f, "unrepresentable request"),
            Self::OutOfMemory => write!(f, "page source exhausted"),
        }
    }
}

/// Raw-pointer allocation interface for callers that want the classic
/// malloc shape rather than `Result` plumbing.
pub trait Allocator {
    /// Allocate `size` bytes, or return nil.
    fn alloc(&mut self, size: usize) -> *mut u8;
    /// Release an allocation.  Panics on a pointer that fails
    /// validation, nil included.
    fn free(&mut self, addr: *mut u8);
}

/// Snapshot of heap occupancy.  Parked blocks are counted separately
/// from live allocations throughout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub region_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub quick_blocks: usize,
    pub quick_bytes: usize,
    pub live_payload: usize,
    pub peak_payload: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region: {} allocated: {}/{} free: {}/{} parked: {}/{} payload: {} peak: {}",
            self.region_bytes,
            self.allocated_blocks,
            self.allocated_bytes,
            self.free_blocks,
            self.free_bytes,
            self.quick_blocks,
            self.quick_bytes,
            self.live_payload,
            self.peak_payload,
        )
    }
}

/// Segregated-fit heap with quick-list caching over a page source.
pub struct Heap<S> {
    source: S,
    free_lists: FreeLists,
    quick_lists: [QuickList; NUM_QUICK_LISTS],
    mask: u64,
    live_payload: usize,
    peak_payload: usize,
}

impl<S: PageSource> Heap<S> {
    pub fn new(source: S) -> Heap<S> {
        Heap::with_mask(source, DEFAULT_MASK)
    }

    /// A heap whose boundary words are masked with `mask` instead of the
    /// default constant.  The mask must be nonzero for the corruption
    /// check to bite.
    pub fn with_mask(source: S, mask: u64) -> Heap<S> {
        debug_assert_ne!(mask, 0);
        Heap {
            source,
            free_lists: FreeLists::new(),
            quick_lists: [QuickList::new(); NUM_QUICK_LISTS],
            mask,
            live_payload: 0,
            peak_payload: 0,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn region_len(&self) -> usize {
        self.source.end() as usize - self.source.start() as usize
    }

    fn region_is_empty(&self) -> bool {
        self.source.start() == self.source.end()
    }

    fn view(&self) -> BlockView {
        BlockView::new(self.source.start(), self.region_len(), self.mask)
    }

    /// Allocate a block able to hold `size` payload bytes.  A zero-size
    /// request returns `Ok(None)` without touching the heap.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        if size == 0 {
            return Ok(None);
        }
        if size > MAX_PAYLOAD_SIZE {
            return Err(HeapError::BadSize);
        }
        if self.region_is_empty() {
            self.bootstrap()?;
        }
        let bsz = block_size_for(size);
        if let Some(p) = self.take_fit(size, bsz) {
            return Ok(Some(p));
        }
        self.grow_for(bsz)?;
        let p = self.take_fit(size, bsz).expect("grown tail fits the request");
        Ok(Some(p))
    }

    /// Release the block whose payload starts at `p`.
    ///
    /// # Panics
    /// Panics if `p` fails pointer validation: nil, misaligned, out of
    /// range, not currently allocated, parked in a quick list, or
    /// carrying an inconsistent boundary encoding.  An invalid free is a
    /// caller bug or corrupted memory, neither of which is recoverable.
    pub fn free(&mut self, p: *mut u8) {
        let v = self.view();
        let b = match payload_block(&v, p) {
            Ok(b) => b,
            Err(err) => panic!("free({p:p}): {err}"),
        };
        self.release(&v, b);
    }

    /// Resize the allocation at `p`.  Returns `Ok(None)` only for
    /// `size == 0`, which frees the block.  A pointer that fails
    /// validation yields [`HeapError::BadSize`] and leaves the heap
    /// untouched.
    pub fn reallocate(
        &mut self,
        p: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let v = self.view();
        let b = payload_block(&v, p).map_err(|_| HeapError::BadSize)?;
        if size == 0 {
            self.release(&v, b);
            return Ok(None);
        }
        if size > MAX_PAYLOAD_SIZE {
            return Err(HeapError::BadSize);
        }

        let header = v.header(b);
        let old_payload = header.payload_size() as usize;
        if size == old_payload {
            return Ok(Some(v.payload_ptr(b)));
        }

        if size > old_payload {
            // Grow by moving: a fresh block, the old payload copied over,
            // the old block released.
            let new = self.allocate(size)?.expect("sized request yields a block");
            let v = self.view();
            let nb = new.as_ptr() as usize - v.base() as usize - ALIGN_SIZE;
            v.copy_payload(b, nb, old_payload);
            self.release(&v, b);
            return Ok(Some(new));
        }

        // Shrink in place, splitting off the tail when it makes a whole
        // block.
        let bsz = header.block_size();
        let new_bsz = block_size_for(size);
        let remainder = bsz - new_bsz;
        if remainder >= MIN_BLOCK_SIZE {
            v.set_header(
                b,
                Header::new(size as u32, new_bsz)
                    .with_allocated(true)
                    .with_prev_allocated(header.prev_allocated()),
            );
            let r = b + new_bsz;
            v.set_header(r, Header::new(0, remainder).with_prev_allocated(true));
            v.write_footer(r);
            v.set_prev_allocated(v.next(r), false);
            let merged = self.coalesce(&v, r);
            self.free_lists
                .insert(&v, class_of(v.header(merged).block_size()), merged);
        } else {
            v.set_header(
                b,
                Header::new(size as u32, bsz)
                    .with_allocated(true)
                    .with_prev_allocated(header.prev_allocated()),
            );
        }
        self.live_payload -= old_payload - size;
        Ok(Some(v.payload_ptr(b)))
    }

    /// Fraction of live allocated bytes that are caller payload; zero
    /// while nothing is live.  Parked blocks do not count as allocated.
    pub fn internal_fragmentation(&self) -> f64 {
        if self.region_is_empty() {
            return 0.0;
        }
        let v = self.view();
        let mut payload = 0u64;
        let mut total = 0u64;
        for b in self.block_offsets() {
            let h = v.header(b);
            if h.allocated() && !h.in_quick() {
                payload += u64::from(h.payload_size());
                total += h.block_size() as u64;
            }
        }
        if total == 0 {
            return 0.0;
        }
        payload as f64 / total as f64
    }

    /// High-water aggregate payload as a fraction of the region; zero
    /// while the region is empty.
    pub fn peak_utilization(&self) -> f64 {
        let len = self.region_len();
        if len == 0 {
            return 0.0;
        }
        self.peak_payload as f64 / len as f64
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            region_bytes: self.region_len(),
            live_payload: self.live_payload,
            peak_payload: self.peak_payload,
            ..HeapStats::default()
        };
        let v = self.view();
        for b in self.block_offsets() {
            let h = v.header(b);
            if !h.allocated() {
                stats.free_blocks += 1;
                stats.free_bytes += h.block_size();
            } else if h.in_quick() {
                stats.quick_blocks += 1;
                stats.quick_bytes += h.block_size();
            } else {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += h.block_size();
            }
        }
        stats
    }

    /// Members of free-list class `class` as `(offset, size)` pairs,
    /// most recently inserted first.
    pub fn free_class(&self, class: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let v = self.view();
        self.free_lists
            .iter_class(v, class)
            .map(move |b| (b, v.header(b).block_size()))
    }

    /// Members of quick bucket `index` as `(offset, size)` pairs, most
    /// recently parked first.
    pub fn quick_bucket(&self, index: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let v = self.view();
        self.quick_lists[index]
            .iter(v)
            .map(move |b| (b, v.header(b).block_size()))
    }

    /// Walk every block between prologue and epilogue in address order.
    fn block_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        let v = self.view();
        let epilogue = if v.len() >= MIN_BLOCK_SIZE + ALIGN_SIZE {
            v.len() - ALIGN_SIZE
        } else {
            0
        };
        let mut off = MIN_BLOCK_SIZE;
        core::iter::from_fn(move || {
            if off >= epilogue {
                return None;
            }
            let b = off;
            off += v.header(b).block_size();
            Some(b)
        })
    }

    /// First allocation: obtain one page, lay down the prologue and
    /// epilogue, and list the remaining body as a single free block.
    fn bootstrap(&mut self) -> Result<(), HeapError> {
        if self.source.grow().is_none() {
            return Err(HeapError::OutOfMemory);
        }
        let v = self.view();
        debug_assert!(v.len() >= PAGE_SIZE);
        debug_assert_eq!(v.base() as usize % ALIGN_SIZE, 0);

        v.set_header(0, Header::new(0, MIN_BLOCK_SIZE).with_allocated(true));
        let epilogue = v.len() - ALIGN_SIZE;
        v.set_header(epilogue, Header::new(0, 0).with_allocated(true));

        let body = MIN_BLOCK_SIZE;
        let body_size = epilogue - body;
        v.set_header(body, Header::new(0, body_size).with_prev_allocated(true));
        v.write_footer(body);
        self.free_lists.insert(&v, class_of(body_size), body);
        Ok(())
    }

    /// Serve a request from the quick lists or the free lists, or report
    /// that the region has no fit.
    fn take_fit(&mut self, payload: usize, bsz: usize) -> Option<NonNull<u8>> {
        let v = self.view();

        if let Some(index) = index_for(bsz) {
            if let Some(b) = self.quick_lists[index].pop(&v) {
                let h = v.header(b);
                debug_assert!(h.allocated() && h.in_quick() && h.block_size() == bsz);
                v.set_header(
                    b,
                    Header::new(payload as u32, bsz)
                        .with_allocated(true)
                        .with_prev_allocated(h.prev_allocated()),
                );
                v.set_prev_allocated(v.next(b), true);
                self.note_alloc(payload);
                return Some(v.payload_ptr(b));
            }
        }

        for class in class_of(bsz)..NUM_FREE_LISTS {
            let Some(b) = self.free_lists.first_fit(&v, class, bsz) else {
                continue;
            };
            self.free_lists.remove(&v, b);
            let h = v.header(b);
            let remainder = h.block_size() - bsz;
            if remainder >= MIN_BLOCK_SIZE {
                // Carve the low part and return the splinter to its
                // class.  The splinter's right neighbor was this block's
                // neighbor, which is allocated, so there is nothing to
                // coalesce with.
                v.set_header(
                    b,
                    Header::new(payload as u32, bsz)
                        .with_allocated(true)
                        .with_prev_allocated(h.prev_allocated()),
                );
                let r = b + bsz;
                v.set_header(r, Header::new(0, remainder).with_prev_allocated(true));
                v.write_footer(r);
                self.free_lists.insert(&v, class_of(remainder), r);
            } else {
                v.set_header(
                    b,
                    Header::new(payload as u32, h.block_size())
                        .with_allocated(true)
                        .with_prev_allocated(h.prev_allocated()),
                );
                v.set_prev_allocated(v.next(b), true);
            }
            self.note_alloc(payload);
            return Some(v.payload_ptr(b));
        }
        None
    }

    /// Extend the region one page at a time until the free tail can hold
    /// a block of `bsz` bytes.  On exhaustion everything already
    /// acquired stays behind as one coalesced free tail.
    fn grow_for(&mut self, bsz: usize) -> Result<(), HeapError> {
        let v = self.view();
        let mut tail = v.len() - ALIGN_SIZE;
        let mut supremum = if v.header(tail).prev_allocated() {
            0
        } else {
            v.header(v.prev(tail)).block_size()
        };

        while supremum < bsz {
            if self.source.grow().is_none() {
                return Err(HeapError::OutOfMemory);
            }
            let v = self.view();
            // The first pass sees the old epilogue here, which is marked
            // allocated and therefore not unlinked.
            self.free_lists.remove(&v, tail);
            let epilogue = v.len() - ALIGN_SIZE;
            let prev_allocated = v.header(tail).prev_allocated();
            v.set_header(epilogue, Header::new(0, 0).with_allocated(true));
            v.set_header(
                tail,
                Header::new(0, epilogue - tail).with_prev_allocated(prev_allocated),
            );
            v.write_footer(tail);
            tail = self.coalesce(&v, tail);
            self.free_lists
                .insert(&v, class_of(v.header(tail).block_size()), tail);
            supremum += PAGE_SIZE;
        }
        Ok(())
    }

    /// Free the validated block at `b`: park it when a quick list covers
    /// its size, otherwise coalesce it into the free lists.
    fn release(&mut self, v: &BlockView, b: usize) {
        let header = v.header(b);
        let bsz = header.block_size();
        self.live_payload -= header.payload_size() as usize;

        if let Some(index) = index_for(bsz) {
            if self.quick_lists[index].is_full() {
                self.flush_quick(v, index);
            }
            // Flushing may have freed the physical predecessor; reread
            // the header before tagging it.
            v.set_header(b, v.header(b).with_in_quick(true));
            self.quick_lists[index].push(v, b);
            v.set_prev_allocated(v.next(b), true);
            return;
        }

        v.set_header(b, Header::new(0, bsz).with_prev_allocated(header.prev_allocated()));
        v.write_footer(b);
        v.set_prev_allocated(v.next(b), false);
        let merged = self.coalesce(v, b);
        self.free_lists
            .insert(v, class_of(v.header(merged).block_size()), merged);
    }

    /// Empty quick bucket `index`, returning every parked block to the
    /// free lists with eager coalescing.
    fn flush_quick(&mut self, v: &BlockView, index: usize) {
        while let Some(b) = self.quick_lists[index].pop(v) {
            let header = v.header(b);
            v.set_header(
                b,
                Header::new(0, header.block_size()).with_prev_allocated(header.prev_allocated()),
            );
            v.write_footer(b);
            v.set_prev_allocated(v.next(b), false);
            let merged = self.coalesce(v, b);
            self.free_lists
                .insert(v, class_of(v.header(merged).block_size()), merged);
        }
    }

    /// Merge the free block at `b` with whichever physical neighbors are
    /// free, fixing up list membership, and return the merged block.
    /// The caller has already written `b`'s free header and footer and
    /// cleared the successor's `prev_allocated` flag.
    fn coalesce(&mut self, v: &BlockView, b: usize) -> usize {
        let header = v.header(b);
        let next = b + header.block_size();
        let prev_free = !header.prev_allocated();
        let next_free = !v.header(next).allocated();

        match (prev_free, next_free) {
            (false, false) => b,
            (false, true) => {
                self.free_lists.remove(v, next);
                let merged = header.block_size() + v.header(next).block_size();
                v.set_header(b, Header::new(0, merged).with_prev_allocated(true));
                v.write_footer(b);
                b
            }
            (true, false) => {
                let p = v.prev(b);
                self.free_lists.remove(v, p);
                let ph = v.header(p);
                let merged = ph.block_size() + header.block_size();
                v.set_header(
                    p,
                    Header::new(0, merged).with_prev_allocated(ph.prev_allocated()),
                );
                v.write_footer(p);
                p
            }
            (true, true) => {
                let p = v.prev(b);
                self.free_lists.remove(v, p);
                self.free_lists.remove(v, next);
                let ph = v.header(p);
                let merged =
                    ph.block_size() + header.block_size() + v.header(next).block_size();
                v.set_header(
                    p,
                    Header::new(0, merged).with_prev_allocated(ph.prev_allocated()),
                );
                v.write_footer(p);
                p
            }
        }
    }

    fn note_alloc(&mut self, payload: usize) {
        self.live_payload += payload;
        if self.live_payload > self.peak_payload {
            self.peak_payload = self.live_payload;
        }
    }

    /// Check every structural invariant of the region.  Violations panic
    /// in debug builds; intended for tests and debugging.
    pub fn assert_consistent(&self) {
        if self.region_is_empty() {
            return;
        }
        let v = self.view();
        let len = v.len();
        debug_assert_eq!(len % PAGE_SIZE, 0);

        let prologue = v.header(0);
        debug_assert!(prologue.allocated());
        debug_assert_eq!(prologue.block_size(), MIN_BLOCK_SIZE);
        let epilogue_off = len - ALIGN_SIZE;
        let epilogue = v.header(epilogue_off);
        debug_assert!(epilogue.allocated());
        debug_assert_eq!(epilogue.block_size(), 0);

        let mut off = MIN_BLOCK_SIZE;
        let mut prev_allocated = true;
        let mut prev_was_free = false;
        let mut free_count = 0usize;
        let mut quick_count = 0usize;
        while off < epilogue_off {
            let h = v.header(off);
            let size = h.block_size();
            debug_assert!(
                size >= MIN_BLOCK_SIZE && size % ALIGN_SIZE == 0,
                "bad block size at {off}"
            );
            debug_assert!(off + size <= epilogue_off, "block at {off} overruns the epilogue");
            debug_assert_eq!(
                h.prev_allocated(),
                prev_allocated,
                "stale prev-allocated flag at {off}"
            );
            if h.allocated() {
                if h.in_quick() {
                    quick_count += 1;
                }
            } else {
                debug_assert!(!h.in_quick(), "free block tagged in-quick at {off}");
                debug_assert_eq!(
                    v.read_masked(off + size),
                    h.raw(),
                    "footer mismatch at {off}"
                );
                debug_assert!(!prev_was_free, "uncoalesced neighbors at {off}");
                free_count += 1;
            }
            prev_was_free = !h.allocated();
            prev_allocated = h.allocated();
            off += size;
        }
        debug_assert_eq!(off, epilogue_off, "block walk missed the epilogue");
        debug_assert_eq!(epilogue.prev_allocated(), prev_allocated);

        // Every free block is listed exactly once, in the right class.
        let mut listed = 0usize;
        for class in 0..NUM_FREE_LISTS {
            for b in self.free_lists.iter_class(v, class) {
                let h = v.header(b);
                debug_assert!(!h.allocated(), "allocated block listed free at {b}");
                debug_assert_eq!(class_of(h.block_size()), class, "misclassed block at {b}");
                listed += 1;
            }
        }
        debug_assert_eq!(listed, free_count);

        // Every parked block sits in the bucket of its exact size.
        let mut parked = 0usize;
        for (index, bucket) in self.quick_lists.iter().enumerate() {
            let mut members = 0usize;
            for b in bucket.iter(v) {
                let h = v.header(b);
                debug_assert!(h.allocated() && h.in_quick(), "mistagged quick block at {b}");
                debug_assert_eq!(h.block_size(), size_at(index), "wrong bucket for block at {b}");
                members += 1;
            }
            debug_assert_eq!(members, bucket.len());
            parked += members;
        }
        debug_assert_eq!(parked, quick_count);
    }
}

impl<S: PageSource> Allocator for Heap<S> {
    fn alloc(&mut self, size: usize) -> *mut u8 {
        match self.allocate(size) {
            Ok(Some(p)) => p.as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    fn free(&mut self, addr: *mut u8) {
        Heap::free(self, addr);
    }
}
