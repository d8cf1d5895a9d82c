use std::ptr::NonNull;

use crate::list::Node;

/// Every piece of metadata the allocator stores points to its previous and
/// next neighbor, so headers and linked list nodes are the same thing. This
/// alias exists for code that wants to talk about block headers without
/// thinking about list mechanics.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns a pointer to the [`Header<T>`] that sits right before
    /// `address` in memory.
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Returned pointer.
    /// +-------------+
    /// |   Payload   | <- Given address.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// `address` must point exactly to the first byte after a live
    /// [`Header<T>`]. Payload pointers previously produced by
    /// [`Header::content_address_of`] satisfy this; anything else is
    /// undefined behaviour.
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address right after the header, which is where its
    /// payload starts.
    ///
    /// # Safety
    ///
    /// `header` must point to a live [`Header<T>`]. The returned address is
    /// usable for up to `size` bytes, where `size` is the field stored in
    /// [`crate::block::Block`].
    ///
    /// This is an associated function rather than a method so that no
    /// intermediate `&self` reference is created, which keeps Miri's borrow
    /// tracking happy.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }
}
