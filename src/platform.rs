use std::ptr::NonNull;

use crate::Pointer;

/// Source of raw virtual memory. The allocator needs two kinds of backing:
/// a single contiguous region whose upper bound can be pushed up (and, in
/// one reallocation case, moved to an absolute address), and independent
/// anonymous mappings for requests too large for that region. How those
/// are obtained is a platform concern, so it lives behind this trait.
///
/// [`OsMemory`] is the real implementation. Tests run the allocator over a
/// fixed in-process arena instead, because a test binary already has a
/// libc allocator moving the program break underneath us.
pub trait MemorySource {
    /// Advances the break by `delta` bytes and returns the previous break,
    /// which is the start of the newly usable bytes. `None` if the OS
    /// refuses.
    ///
    /// # Safety
    ///
    /// The caller becomes responsible for the returned bytes; nothing else
    /// in the process may adjust the break.
    unsafe fn extend_break(&mut self, delta: usize) -> Pointer<u8>;

    /// Moves the break to an absolute address. Returns `false` if the OS
    /// refuses.
    ///
    /// # Safety
    ///
    /// `address` must lie within the break region.
    unsafe fn set_break(&mut self, address: NonNull<u8>) -> bool;

    /// Returns a fresh private anonymous mapping of `length` bytes,
    /// readable, writable and zero-filled. `None` if the OS refuses.
    ///
    /// # Safety
    ///
    /// Mapped memory must later be released with [`MemorySource::unmap`].
    unsafe fn map(&mut self, length: usize) -> Pointer<u8>;

    /// Releases a mapping previously obtained from [`MemorySource::map`].
    ///
    /// # Safety
    ///
    /// `address` and `length` must describe exactly one prior mapping.
    unsafe fn unmap(&mut self, address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    fn page_size(&self) -> usize;
}

/// Refusal of the underlying primitives is not recoverable: there is no
/// way to report partial failure to the caller beyond the null sentinel,
/// and callers don't expect null from well-formed requests. Print one
/// diagnostic and abort.
pub(crate) fn out_of_memory(primitive: &str) -> ! {
    eprintln!("brkalloc: the OS refused to provide memory ({primitive} failed)");
    std::process::abort()
}

/// Process-wide OS implementation of [`MemorySource`].
///
/// There is exactly one program break per process, so at most one value of
/// this type should be driving allocations at any given time.
#[cfg(unix)]
pub struct OsMemory;

#[cfg(unix)]
impl OsMemory {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl Default for OsMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{MemorySource, OsMemory};
    use crate::Pointer;

    impl MemorySource for OsMemory {
        unsafe fn extend_break(&mut self, delta: usize) -> Pointer<u8> {
            let address = libc::sbrk(delta as libc::intptr_t);

            // sbrk reports failure with (void *) -1.
            if address == usize::MAX as *mut libc::c_void {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn set_break(&mut self, address: NonNull<u8>) -> bool {
            libc::brk(address.cast().as_ptr()) == 0
        }

        unsafe fn map(&mut self, length: usize) -> Pointer<u8> {
            // Read-Write memory, private to this process and not backed by
            // any file. The kernel hands it out zero-filled.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);

            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn unmap(&mut self, address: NonNull<u8>, length: usize) {
            // On failure the mapping stays valid; there is nobody to report
            // that to, so the bytes are simply leaked.
            libc::munmap(address.cast().as_ptr(), length);
        }

        fn page_size(&self) -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

/// Process-wide OS implementation of [`MemorySource`].
///
/// Windows has no program break, so one is emulated: a large span of
/// address space is reserved up front and pages are committed as the
/// break advances. Reserving is free (no physical memory is consumed
/// until commit), which is exactly the property the break region needs.
#[cfg(windows)]
pub struct OsMemory {
    /// Start of the reserved span, `None` until first use.
    base: Pointer<u8>,
    /// Current break, as an offset from `base`.
    brk: usize,
    /// Bytes committed from `base`, always page-rounded.
    committed: usize,
}

#[cfg(windows)]
impl OsMemory {
    /// Address space reserved for the emulated break region.
    const RESERVED_SPAN: usize = 1 << 30;

    pub const fn new() -> Self {
        Self {
            base: None,
            brk: 0,
            committed: 0,
        }
    }
}

#[cfg(windows)]
impl Default for OsMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{MemorySource, OsMemory};
    use crate::Pointer;

    impl OsMemory {
        /// Reserves the break span on first use.
        unsafe fn base(&mut self) -> Pointer<u8> {
            if self.base.is_none() {
                let address = Memory::VirtualAlloc(
                    None,
                    Self::RESERVED_SPAN,
                    Memory::MEM_RESERVE,
                    Memory::PAGE_NOACCESS,
                );
                self.base = NonNull::new(address.cast());
            }

            self.base
        }

        /// Commits pages so that the first `limit` bytes of the span are
        /// usable. `VirtualAlloc` rounds the range to page boundaries on
        /// its own, the page-rounded `committed` mark only avoids
        /// re-committing on every small extension.
        unsafe fn commit_up_to(&mut self, base: NonNull<u8>, limit: usize) -> bool {
            if limit <= self.committed {
                return true;
            }

            let address = base.as_ptr().add(self.committed);
            let length = limit - self.committed;
            let committed = Memory::VirtualAlloc(
                Some(address as *const c_void),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            if committed.is_null() {
                return false;
            }

            let page = self.page_size();
            self.committed = (limit + page - 1) / page * page;
            true
        }
    }

    impl MemorySource for OsMemory {
        unsafe fn extend_break(&mut self, delta: usize) -> Pointer<u8> {
            let base = self.base()?;

            let new_brk = self.brk.checked_add(delta)?;
            if new_brk > Self::RESERVED_SPAN || !self.commit_up_to(base, new_brk) {
                return None;
            }

            let old = NonNull::new_unchecked(base.as_ptr().add(self.brk));
            self.brk = new_brk;

            Some(old)
        }

        unsafe fn set_break(&mut self, address: NonNull<u8>) -> bool {
            let Some(base) = self.base else {
                return false;
            };

            let offset = address.as_ptr().offset_from(base.as_ptr());
            if offset < 0 || offset as usize > Self::RESERVED_SPAN {
                return false;
            }

            let offset = offset as usize;
            if !self.commit_up_to(base, offset) {
                return false;
            }

            // Rewinding keeps pages committed; the break region is a high
            // water mark either way.
            self.brk = offset;
            true
        }

        unsafe fn map(&mut self, length: usize) -> Pointer<u8> {
            // Reserve and commit in one call. Committed pages are
            // zero-filled by the OS, same as an anonymous mmap.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let address = Memory::VirtualAlloc(None, length, flags, Memory::PAGE_READWRITE);

            NonNull::new(address.cast())
        }

        unsafe fn unmap(&mut self, address: NonNull<u8>, _length: usize) {
            // Releasing with length 0 frees the whole allocation. On
            // failure the bytes are leaked, same as the unix path.
            let _ = Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE);
        }

        fn page_size(&self) -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod arena {
    //! Deterministic [`MemorySource`] for tests. The break region is a
    //! slab obtained once from the std allocator and the break is just an
    //! offset into it; mappings are separate std allocations. Besides
    //! keeping the real break untouched, this records every map and unmap
    //! so tests can assert on the traffic.

    use std::{alloc, alloc::Layout, ptr::NonNull};

    use super::MemorySource;
    use crate::Pointer;

    pub(crate) struct ArenaMemory {
        slab: NonNull<u8>,
        capacity: usize,
        brk: usize,
        /// Lengths passed to [`MemorySource::map`], in call order.
        pub maps: Vec<usize>,
        /// Lengths passed to [`MemorySource::unmap`], in call order.
        pub unmaps: Vec<usize>,
    }

    impl ArenaMemory {
        pub const PAGE_SIZE: usize = 4096;

        pub fn new(capacity: usize) -> Self {
            // Zero-filled so that every byte of the fake break region is
            // initialized memory, like the real one.
            let slab = unsafe { alloc::alloc_zeroed(Self::layout(capacity)) };

            Self {
                slab: NonNull::new(slab).unwrap(),
                capacity,
                brk: 0,
                maps: Vec::new(),
                unmaps: Vec::new(),
            }
        }

        fn layout(length: usize) -> Layout {
            Layout::from_size_align(length, Self::PAGE_SIZE).unwrap()
        }

        /// Current break, as an offset from the start of the slab.
        pub fn break_offset(&self) -> usize {
            self.brk
        }

        /// Address the break currently points at.
        pub fn break_address(&self) -> NonNull<u8> {
            unsafe { NonNull::new_unchecked(self.slab.as_ptr().add(self.brk)) }
        }
    }

    impl MemorySource for ArenaMemory {
        unsafe fn extend_break(&mut self, delta: usize) -> Pointer<u8> {
            if self.brk + delta > self.capacity {
                return None;
            }

            let old = NonNull::new_unchecked(self.slab.as_ptr().add(self.brk));
            self.brk += delta;

            Some(old)
        }

        unsafe fn set_break(&mut self, address: NonNull<u8>) -> bool {
            let offset = address.as_ptr().offset_from(self.slab.as_ptr());

            if offset < 0 || offset as usize > self.capacity {
                return false;
            }

            self.brk = offset as usize;
            true
        }

        unsafe fn map(&mut self, length: usize) -> Pointer<u8> {
            self.maps.push(length);
            NonNull::new(alloc::alloc_zeroed(Self::layout(length)))
        }

        unsafe fn unmap(&mut self, address: NonNull<u8>, length: usize) {
            self.unmaps.push(length);
            alloc::dealloc(address.as_ptr(), Self::layout(length));
        }

        fn page_size(&self) -> usize {
            Self::PAGE_SIZE
        }
    }

    impl Drop for ArenaMemory {
        fn drop(&mut self) {
            unsafe { alloc::dealloc(self.slab.as_ptr(), Self::layout(self.capacity)) }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn break_moves_and_rewinds() {
            let mut arena = ArenaMemory::new(4096);

            unsafe {
                let first = arena.extend_break(128).unwrap();
                let second = arena.extend_break(64).unwrap();

                assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 128);
                assert_eq!(arena.break_offset(), 192);

                assert!(arena.set_break(first));
                assert_eq!(arena.break_offset(), 0);

                // Exhausting the slab reports refusal instead of handing
                // out foreign memory.
                assert!(arena.extend_break(8192).is_none());
            }
        }

        #[test]
        fn mappings_are_zeroed_and_recorded() {
            let mut arena = ArenaMemory::new(4096);

            unsafe {
                let mapping = arena.map(256).unwrap();
                for i in 0..256 {
                    assert_eq!(*mapping.as_ptr().add(i), 0);
                }

                arena.unmap(mapping, 256);
            }

            assert_eq!(arena.maps, [256]);
            assert_eq!(arena.unmaps, [256]);
        }
    }
}
