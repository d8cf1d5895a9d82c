use std::ptr::NonNull;

use crate::{
    block::{Block, BlockStatus, BLOCK_HEADER_SIZE},
    header::Header,
    list::{LinkedList, Node},
    platform::{out_of_memory, MemorySource},
    Pointer,
};

/// How much break memory is reserved the first time the break region is
/// used, instead of extending it by just the requested size. The excess
/// becomes one trailing free block that serves subsequent small requests
/// without further syscalls.
pub(crate) const INIT_MEM_ALLOC: usize = 128 * 1024;

/// The break-region heap: a memory source plus the address-ordered list of
/// blocks carved out of the break region.
///
/// ```text
///                       program break ----------------------------+
///                                                                 |
/// +-------+---------+-------+-----------+-------+---------------+ v
/// | Block | payload | Block |  payload  | Block |    payload    |
/// +-------+---------+-------+-----------+-------+---------------+
///    ^                  ^                   ^
///    |                  |                   |
///    +--- blocks.head   +--- next = prev    +--- blocks.tail
/// ```
///
/// Each block's payload ends exactly where the next block's header starts,
/// so the list is contiguous, address ordered, and the tail payload ends
/// at the current break. Mapped blocks are created here too but they are
/// never linked; they live in their own mappings until freed.
pub(crate) struct Heap<S: MemorySource> {
    source: S,
    blocks: LinkedList<Block>,
}

impl<S: MemorySource> Heap<S> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            blocks: LinkedList::new(),
        }
    }

    /// Whether the break region has been touched yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.len() == 0
    }

    /// Page size of the underlying source.
    pub fn page_size(&self) -> usize {
        self.source.page_size()
    }

    /// See [`MemorySource::set_break`]. Only the in-place tail growth of
    /// reallocation needs this.
    pub unsafe fn set_break(&mut self, address: NonNull<u8>) -> bool {
        self.source.set_break(address)
    }

    #[cfg(test)]
    pub fn blocks(&self) -> &LinkedList<Block> {
        &self.blocks
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Satisfies a request for `size` payload bytes from the break region.
    /// `size` must be aligned and small enough that the request belongs
    /// here rather than in a mapping.
    ///
    /// The returned block is marked [`BlockStatus::Alloc`] and holds at
    /// least `size` payload bytes.
    pub unsafe fn allocate(&mut self, size: usize) -> NonNull<Header<Block>> {
        if self.is_empty() {
            return self.reserve_initial(size);
        }

        // Merging adjacent free blocks first makes the search see each
        // free span at its full size.
        self.coalesce();

        if let Some(block) = self.best_fit(size) {
            return block;
        }

        let tail = self.blocks.last().unwrap();

        if tail.as_ref().is_free() {
            self.grow_tail(tail, size)
        } else {
            self.push_tail_block(size)
        }
    }

    /// First use of the break region: extends the break by
    /// [`INIT_MEM_ALLOC`] (or by the exact footprint if that is larger),
    /// creates the first block and splits it so the excess remains as one
    /// trailing free block.
    unsafe fn reserve_initial(&mut self, size: usize) -> NonNull<Header<Block>> {
        let footprint = BLOCK_HEADER_SIZE + size;
        let length = if footprint < INIT_MEM_ALLOC {
            INIT_MEM_ALLOC
        } else {
            footprint
        };

        let Some(address) = self.source.extend_break(length) else {
            out_of_memory("break extension")
        };

        let block = self.blocks.append(
            Block {
                size: length - BLOCK_HEADER_SIZE,
                status: BlockStatus::Alloc,
            },
            address,
        );

        self.split_if_possible(block, size);

        block
    }

    /// Extends the break by a whole new block footprint and appends it as
    /// the allocated tail.
    unsafe fn push_tail_block(&mut self, size: usize) -> NonNull<Header<Block>> {
        let Some(address) = self.source.extend_break(BLOCK_HEADER_SIZE + size) else {
            out_of_memory("break extension")
        };

        self.blocks.append(
            Block {
                size,
                status: BlockStatus::Alloc,
            },
            address,
        )
    }

    /// Grows the free tail block in place so it can hold `size` payload
    /// bytes. Only the payload deficit is requested from the source: the
    /// fresh bytes are absorbed into the existing tail, whose header is
    /// reused, so no header space is spent on the extension.
    unsafe fn grow_tail(
        &mut self,
        mut tail: NonNull<Header<Block>>,
        size: usize,
    ) -> NonNull<Header<Block>> {
        let deficit = size - tail.as_ref().size();

        if self.source.extend_break(deficit).is_none() {
            out_of_memory("break extension")
        }

        tail.as_mut().data.size = size;
        tail.as_mut().data.status = BlockStatus::Alloc;

        tail
    }

    /// Creates a stand-alone mapped block with `size` payload bytes. The
    /// block is not linked into the heap list; its mapping is released as
    /// a whole when the block is freed.
    pub unsafe fn map_block(&mut self, size: usize) -> NonNull<Header<Block>> {
        let Some(address) = self.source.map(BLOCK_HEADER_SIZE + size) else {
            out_of_memory("anonymous mapping")
        };

        let block = address.cast::<Header<Block>>();

        block.as_ptr().write(Node {
            next: None,
            prev: None,
            data: Block {
                size,
                status: BlockStatus::Mapped,
            },
        });

        block
    }

    /// Returns a mapped block's memory, header included, to the source.
    pub unsafe fn unmap_block(&mut self, block: NonNull<Header<Block>>) {
        let length = block.as_ref().total_size();
        self.source.unmap(block.cast(), length);
    }

    /// Best-fit search over the whole list: among the free blocks that can
    /// hold `size` payload bytes, picks the smallest; ties go to the block
    /// found first, which is the lowest address. The winner is split down
    /// to `size` when worthwhile and marked allocated.
    unsafe fn best_fit(&mut self, size: usize) -> Pointer<Header<Block>> {
        let mut best: Pointer<Header<Block>> = None;

        for node in self.blocks.iter() {
            if !node.as_ref().is_free() || node.as_ref().size() < size {
                continue;
            }

            if best.map_or(true, |best| node.as_ref().size() < best.as_ref().size()) {
                best = Some(node);
            }
        }

        let mut block = best?;

        self.split_if_possible(block, size);
        block.as_mut().data.status = BlockStatus::Alloc;

        Some(block)
    }

    /// Carves the excess of `block` beyond `size` payload bytes into a new
    /// free block placed right after it:
    ///
    /// ```text
    /// +--------+----------------------+      +--------+------+--------+------+
    /// | Header |  payload (too big)   |  ->  | Header | size | Header | rest |
    /// +--------+----------------------+      +--------+------+--------+------+
    /// ```
    ///
    /// Nothing happens unless the excess strictly exceeds one header, i.e.
    /// unless the remainder can hold a header plus at least one payload
    /// byte. The leftover slack is accepted as internal fragmentation.
    pub unsafe fn split_if_possible(&mut self, mut block: NonNull<Header<Block>>, size: usize) {
        if block.as_ref().size() <= size + BLOCK_HEADER_SIZE {
            return;
        }

        let remainder = block.as_ref().size() - size - BLOCK_HEADER_SIZE;
        let address = NonNull::new_unchecked(Header::content_address_of(block).as_ptr().add(size));

        self.blocks.insert_after(
            block,
            Block {
                size: remainder,
                status: BlockStatus::Free,
            },
            address,
        );

        block.as_mut().data.size = size;
    }

    /// Absorbs `block.next` into `block`. The neighbor's header becomes
    /// part of `block`'s payload:
    ///
    /// ```text
    /// +--------+------+--------+------+      +--------+------------------+
    /// | Header |  a   | Header |  b   |  ->  | Header |  a + H + b       |
    /// +--------+------+--------+------+      +--------+------------------+
    /// ```
    ///
    /// # Safety
    ///
    /// `block` must have a successor, and the caller must have established
    /// that merging the two is legal.
    pub unsafe fn merge_next(&mut self, mut block: NonNull<Header<Block>>) {
        let next = block.as_ref().next.unwrap();

        block.as_mut().data.size += next.as_ref().total_size();
        self.blocks.remove(next);
    }

    /// Walks the list merging every run of adjacent free blocks into one,
    /// staying on the current block after each merge so longer runs keep
    /// collapsing into it.
    pub unsafe fn coalesce(&mut self) {
        let mut current = self.blocks.first();

        while let Some(node) = current {
            let next = node.as_ref().next;

            match next {
                Some(next) if node.as_ref().is_free() && next.as_ref().is_free() => {
                    self.merge_next(node);
                }
                Some(next) => current = Some(next),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::arena::ArenaMemory;

    fn heap() -> Heap<ArenaMemory> {
        Heap::new(ArenaMemory::new(1024 * 1024))
    }

    /// Payload sizes and statuses of the heap list, in address order.
    unsafe fn layout_of(heap: &Heap<ArenaMemory>) -> Vec<(usize, BlockStatus)> {
        heap.blocks()
            .iter()
            .map(|node| (node.as_ref().size(), node.as_ref().status()))
            .collect()
    }

    #[test]
    fn initial_reservation_leaves_one_trailing_free_block() {
        let mut heap = heap();

        unsafe {
            let block = heap.allocate(104);

            assert_eq!(block.as_ref().size(), 104);
            assert_eq!(
                layout_of(&heap),
                [
                    (104, BlockStatus::Alloc),
                    (INIT_MEM_ALLOC - 2 * BLOCK_HEADER_SIZE - 104, BlockStatus::Free),
                ]
            );

            // One break extension of the full reservation, no mappings.
            assert_eq!(heap.source().break_offset(), INIT_MEM_ALLOC);
            assert!(heap.source().maps.is_empty());
        }
    }

    #[test]
    fn split_requires_room_for_header_and_payload() {
        let mut heap = heap();

        unsafe {
            let block = heap.allocate(64);
            let trailing = block.as_ref().next.unwrap();
            let trailing_size = trailing.as_ref().size();

            // Exactly one header of excess: not worth a split.
            heap.split_if_possible(trailing, trailing_size - BLOCK_HEADER_SIZE);
            assert_eq!(heap.blocks().len(), 2);

            // One more alignment step of excess: split happens and the
            // remainder gets the smallest possible payload.
            heap.split_if_possible(trailing, trailing_size - BLOCK_HEADER_SIZE - 8);
            assert_eq!(heap.blocks().len(), 3);

            let remainder = trailing.as_ref().next.unwrap();
            assert_eq!(remainder.as_ref().size(), 8);
            assert!(remainder.as_ref().is_free());
        }
    }

    #[test]
    fn best_fit_prefers_smallest_then_lowest_address() {
        let mut heap = heap();

        unsafe {
            // Carve four blocks, then free the second and the fourth so the
            // search has two candidates of different sizes.
            let _a = heap.allocate(64);
            let mut b = heap.allocate(256);
            let _c = heap.allocate(64);
            let mut d = heap.allocate(128);

            b.as_mut().data.status = BlockStatus::Free;
            d.as_mut().data.status = BlockStatus::Free;

            // 128 fits both; the 128-byte block is smaller and must win
            // even though it sits at a higher address.
            let hit = heap.best_fit(128).unwrap();
            assert_eq!(hit, d);
            assert_eq!(hit.as_ref().status(), BlockStatus::Alloc);

            // Now only the 256-byte block remains; a 64-byte request
            // splits it.
            let hit = heap.best_fit(64).unwrap();
            assert_eq!(hit, b);
            assert_eq!(hit.as_ref().size(), 64);
            assert_eq!(
                hit.as_ref().next.unwrap().as_ref().size(),
                256 - 64 - BLOCK_HEADER_SIZE
            );
        }
    }

    #[test]
    fn coalesce_collapses_free_runs() {
        let mut heap = heap();

        unsafe {
            let mut a = heap.allocate(64);
            let mut b = heap.allocate(64);
            let mut c = heap.allocate(64);

            a.as_mut().data.status = BlockStatus::Free;
            b.as_mut().data.status = BlockStatus::Free;
            c.as_mut().data.status = BlockStatus::Free;

            // a, b, c and the trailing reservation block are all free and
            // adjacent: they must collapse into a single block.
            heap.coalesce();

            assert_eq!(
                layout_of(&heap),
                [(INIT_MEM_ALLOC - BLOCK_HEADER_SIZE, BlockStatus::Free)]
            );
        }
    }

    #[test]
    fn free_tail_grows_in_place_by_the_deficit() {
        let mut heap = heap();

        unsafe {
            let first = heap.allocate(104);
            let trailing = first.as_ref().next.unwrap();
            let trailing_size = trailing.as_ref().size();
            let break_before = heap.source().break_offset();

            // Nothing free can hold this, but the free tail only misses
            // 96 bytes; those are the only bytes requested.
            let block = heap.allocate(trailing_size + 96);

            assert_eq!(block, trailing);
            assert_eq!(block.as_ref().status(), BlockStatus::Alloc);
            assert_eq!(block.as_ref().size(), trailing_size + 96);
            assert_eq!(heap.source().break_offset(), break_before + 96);
            assert_eq!(heap.blocks().len(), 2);
        }
    }

    #[test]
    fn allocated_tail_gets_a_new_block_after_it() {
        let mut heap = heap();

        unsafe {
            let first = heap.allocate(104);
            let trailing = first.as_ref().next.unwrap();

            // Take the whole trailing block so the tail ends up allocated.
            let second = heap.allocate(trailing.as_ref().size());
            assert_eq!(second, trailing);
            assert_eq!(heap.blocks().len(), 2);

            let break_before = heap.source().break_offset();
            let third = heap.allocate(40);

            assert_eq!(heap.blocks().len(), 3);
            assert_eq!(heap.blocks().last(), Some(third));
            assert_eq!(
                third.as_ptr() as usize,
                second.as_ptr() as usize + second.as_ref().total_size()
            );
            assert_eq!(
                heap.source().break_offset(),
                break_before + BLOCK_HEADER_SIZE + 40
            );
        }
    }

    #[test]
    fn mapped_blocks_stay_out_of_the_list() {
        let mut heap = heap();

        unsafe {
            let block = heap.map_block(4096);

            assert_eq!(block.as_ref().status(), BlockStatus::Mapped);
            assert_eq!(block.as_ref().next, None);
            assert_eq!(block.as_ref().prev, None);
            assert!(heap.is_empty());
            assert_eq!(heap.source().maps, [4096 + BLOCK_HEADER_SIZE]);

            heap.unmap_block(block);
            assert_eq!(heap.source().unmaps, [4096 + BLOCK_HEADER_SIZE]);
        }
    }
}
