use std::{
    cmp,
    ptr::{self, NonNull},
};

use crate::{
    align::align,
    block::{Block, BlockStatus, BLOCK_HEADER_SIZE},
    header::Header,
    heap::Heap,
    platform::{out_of_memory, MemorySource, OsMemory},
    Pointer,
};

/// Requests whose total footprint (payload plus header) exceeds this many
/// bytes are served from their own anonymous mapping instead of the break
/// region. Keeping huge allocations out of the break region means freeing
/// them returns the memory to the OS immediately, while the break region
/// itself only ever grows.
pub(crate) const MMAP_THRESHOLD: usize = 128 * 1024;

/// General purpose allocator over two backing sources: the program break
/// for small requests and independent anonymous mappings for large ones.
/// Break-region blocks form an address-ordered doubly linked list and are
/// recycled with a best-fit policy, block splitting, coalescing of free
/// neighbors and in-place growth of the topmost block.
///
/// The allocator is single threaded by construction: every operation takes
/// `&mut self` and there is no internal locking. The backing source is
/// pluggable through [`MemorySource`]; [`OsMemory`] talks to the real OS,
/// and since there is only one program break per process, only one
/// OS-backed allocator should exist at a time.
///
/// # Examples
///
/// ```no_run
/// use brkalloc::Brkalloc;
///
/// let mut allocator = Brkalloc::new();
///
/// let address = allocator.allocate(96).unwrap();
///
/// unsafe {
///     address.as_ptr().write_bytes(0xAA, 96);
///
///     let bigger = allocator.reallocate(Some(address), 256).unwrap();
///     assert_eq!(*bigger.as_ptr(), 0xAA);
///
///     allocator.free(Some(bigger));
/// }
/// ```
pub struct Brkalloc<S: MemorySource = OsMemory> {
    /// Break-region blocks and the backing source.
    heap: Heap<S>,
    /// OS page size, queried lazily on the first zeroed allocation.
    page_size: usize,
}

impl Brkalloc<OsMemory> {
    /// Builds an allocator backed by the operating system. No memory is
    /// requested until the first allocation.
    pub const fn new() -> Self {
        Self::with_source(OsMemory::new())
    }
}

impl Default for Brkalloc<OsMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MemorySource> Brkalloc<S> {
    /// Builds an allocator over the given memory source.
    pub const fn with_source(source: S) -> Self {
        Self {
            heap: Heap::new(source),
            page_size: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn heap(&self) -> &Heap<S> {
        &self.heap
    }

    /// Returns a pointer to at least `size` usable bytes, aligned to 8, or
    /// `None` if `size` is zero. The bytes are uninitialized.
    pub fn allocate(&mut self, size: usize) -> Pointer<u8> {
        let size = align(size);

        if size == 0 {
            return None;
        }

        unsafe {
            let block = if size + BLOCK_HEADER_SIZE > MMAP_THRESHOLD {
                self.heap.map_block(size)
            } else {
                self.heap.allocate(size)
            };

            Some(Header::content_address_of(block))
        }
    }

    /// Returns a pointer to at least `nmemb * size` bytes that all read as
    /// zero, or `None` if either factor is zero or their product overflows.
    ///
    /// Unlike [`Brkalloc::allocate`], the mapping threshold here is the OS
    /// page size, so anything larger than roughly a page gets its own
    /// mapping and arrives zero-filled straight from the OS. Break-region
    /// blocks are recycled memory and are zeroed explicitly.
    pub fn allocate_zeroed(&mut self, nmemb: usize, size: usize) -> Pointer<u8> {
        if nmemb == 0 || size == 0 {
            return None;
        }

        let size = align(nmemb.checked_mul(size)?);

        if self.page_size == 0 {
            self.page_size = self.heap.page_size();
        }

        unsafe {
            if size + BLOCK_HEADER_SIZE > self.page_size {
                let block = self.heap.map_block(size);
                return Some(Header::content_address_of(block));
            }

            let block = self.heap.allocate(size);
            let payload = Header::content_address_of(block);
            payload.as_ptr().write_bytes(0, block.as_ref().size());

            Some(payload)
        }
    }

    /// Releases an allocation. `None` is a no-op, and so is freeing a
    /// break-region block twice.
    ///
    /// Mapped blocks are returned to the OS immediately. Break-region
    /// blocks are only marked free; merging with free neighbors is
    /// deferred to the next allocation.
    ///
    /// # Safety
    ///
    /// `address` must be `None` or a pointer previously returned by this
    /// allocator. Freeing a mapped block twice is undefined behaviour, as
    /// its memory no longer exists after the first call.
    pub unsafe fn free(&mut self, address: Pointer<u8>) {
        let Some(address) = address else { return };

        let mut block = Header::<Block>::from_content_address(address);

        match block.as_ref().status() {
            BlockStatus::Free => (),
            BlockStatus::Mapped => self.heap.unmap_block(block),
            BlockStatus::Alloc => block.as_mut().data.status = BlockStatus::Free,
        }
    }

    /// Resizes an allocation, preserving the payload up to the smaller of
    /// the old and new sizes.
    ///
    /// `None` delegates to [`Brkalloc::allocate`]; a new size of zero
    /// frees and returns `None`; reallocating a block that is already free
    /// fails with `None`. Growth tries the cheap paths first: a block at
    /// the top of the break region grows in place by moving the break, and
    /// any other block swallows adjacent free successors. Only when
    /// neither suffices (or the block lives in a mapping, which cannot be
    /// resized) does the payload move to a fresh allocation.
    ///
    /// # Safety
    ///
    /// `address` must be `None` or a pointer previously returned by this
    /// allocator.
    pub unsafe fn reallocate(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let size = align(size);

        if size == 0 {
            self.free(address);
            return None;
        }

        let Some(address) = address else {
            return self.allocate(size);
        };

        let mut block = Header::<Block>::from_content_address(address);

        match block.as_ref().status() {
            BlockStatus::Free => return None,
            BlockStatus::Mapped => return self.relocate(block, size),
            BlockStatus::Alloc => (),
        }

        if size == block.as_ref().size() {
            return Some(address);
        }

        if size < block.as_ref().size() {
            self.heap.split_if_possible(block, size);
            return Some(address);
        }

        // The topmost block can grow in place: its payload ends at the
        // break, so moving the break to the new payload end is enough.
        if block.as_ref().next.is_none() {
            let end = NonNull::new_unchecked(address.as_ptr().add(size));
            if !self.heap.set_break(end) {
                out_of_memory("break adjustment")
            }

            block.as_mut().data.size = size;
            return Some(address);
        }

        // Swallow free successors one by one; stop as soon as the block
        // is big enough.
        while block.as_ref().next.is_some_and(|next| next.as_ref().is_free()) {
            self.heap.merge_next(block);

            if block.as_ref().size() >= size {
                self.heap.split_if_possible(block, size);
                return Some(address);
            }
        }

        self.relocate(block, size)
    }

    /// Copy-based fallback: allocates a new block of `size` bytes, copies
    /// as much payload as both blocks can hold and frees the old block.
    unsafe fn relocate(&mut self, block: NonNull<Header<Block>>, size: usize) -> Pointer<u8> {
        let new_address = self.allocate(size)?;
        let new_block = Header::<Block>::from_content_address(new_address);

        let count = cmp::min(block.as_ref().size(), new_block.as_ref().size());
        ptr::copy_nonoverlapping(
            Header::content_address_of(block).as_ptr(),
            new_address.as_ptr(),
            count,
        );

        self.free(Some(Header::content_address_of(block)));

        Some(new_address)
    }
}
