//! Direct-map translation from physical addresses to pointers.
//!
//! The platform keeps the entire managed physical range identity-mapped in
//! the kernel's own address space, so converting a [`PhysAddr`] to a usable
//! pointer is a cast. The extension trait keeps those casts in one place and
//! keeps `PhysAddr` itself dereference-free.

use kestrel_abi::PhysAddr;

pub trait PhysAddrDirect {
    fn as_ptr<T>(self) -> *const T;
    fn as_mut_ptr<T>(self) -> *mut T;
}

impl PhysAddrDirect for PhysAddr {
    #[inline]
    fn as_ptr<T>(self) -> *const T {
        self.as_u64() as usize as *const T
    }

    #[inline]
    fn as_mut_ptr<T>(self) -> *mut T {
        self.as_u64() as usize as *mut T
    }
}
