use atomic_traits::Atomic;
use bytemuck::NoUninit;

use std::fmt;
use std::mem;
use std::ops::Sub;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Raw address with word-sized load, store and compare-and-swap.
///
/// This is the only way the lock core touches object memory. All accessors are
/// `unsafe`: the caller vouches that the address points to live, suitably
/// aligned memory of the requested type.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Self = Address(0);

    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// # Safety
    ///
    /// Creates an arbitrary address which may not be valid.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, size: usize) -> Address {
        Address(self.0 + size)
    }

    /// Shift by a signed byte offset.
    pub const fn offset(self, offset: isize) -> Address {
        Address(self.0.wrapping_add_signed(offset))
    }

    /// Shift by `count` values of type `T`.
    pub const fn shift<T>(self, count: isize) -> Address {
        self.offset(mem::size_of::<T>() as isize * count)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    pub const fn align_up(self, align: usize) -> Address {
        Address((self.0 + align - 1) & !(align - 1))
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// # Safety
    ///
    /// The address must point to a live `T`.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        &*self.to_ptr()
    }

    /// # Safety
    ///
    /// The address must be valid for reads of `T`.
    pub unsafe fn load<T: Copy>(self) -> T {
        self.to_ptr::<T>().read()
    }

    /// # Safety
    ///
    /// The address must be valid for writes of `T`. The old value is not dropped.
    pub unsafe fn store<T>(self, value: T) {
        self.to_mut_ptr::<T>().write(value);
    }

    /// # Safety
    ///
    /// The address must point to a live `T`.
    pub unsafe fn atomic_load<T: Atomic>(self, order: Ordering) -> T::Type {
        let loc = &*(self.0 as *const T);
        loc.load(order)
    }

    /// # Safety
    ///
    /// The address must point to a live `T`.
    pub unsafe fn atomic_store<T: Atomic>(self, val: T::Type, order: Ordering) {
        let loc = &*(self.0 as *const T);
        loc.store(val, order)
    }

    /// # Safety
    ///
    /// The address must point to a live `T`.
    pub unsafe fn compare_exchange<T: Atomic>(
        self,
        old: T::Type,
        new: T::Type,
        success: Ordering,
        failure: Ordering,
    ) -> Result<T::Type, T::Type> {
        let loc = &*(self.0 as *const T);
        loc.compare_exchange(old, new, success, failure)
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    fn sub(self, other: Address) -> usize {
        debug_assert!(self.0 >= other.0, "for (addr_a - addr_b), a({}) needs to be larger than b({})", self, other);
        self.0 - other.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Address of one object's lock word.
///
/// Loads and plain stores are performed with atomic instructions so the Rust
/// memory model stays happy, but only [`compare_and_swap`](Self::compare_and_swap)
/// is a read-modify-write.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LockWordSlot(Address);

impl LockWordSlot {
    /// # Safety
    ///
    /// `address` must point to a word-aligned lock word that outlives every use of the slot.
    pub const unsafe fn new(address: Address) -> Self {
        Self(address)
    }

    pub const fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    pub fn load(self, order: Ordering) -> usize {
        unsafe { self.0.atomic_load::<AtomicUsize>(order) }
    }

    #[inline(always)]
    pub fn store(self, word: usize, order: Ordering) {
        unsafe { self.0.atomic_store::<AtomicUsize>(word, order) }
    }

    /// Single compare-and-swap attempt. Returns `true` when `new` was installed.
    #[inline(always)]
    pub fn compare_and_swap(self, expected: usize, new: usize) -> bool {
        unsafe {
            self.0
                .compare_exchange::<AtomicUsize>(expected, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up() {
        unsafe {
            assert_eq!(Address::from_usize(0x10).align_up(0x10), Address::from_usize(0x10));
            assert_eq!(Address::from_usize(0x11).align_up(0x10), Address::from_usize(0x20));
        }
    }

    #[test]
    fn signed_offset() {
        unsafe {
            let base = Address::from_usize(0x100);
            assert_eq!(base.offset(-8), Address::from_usize(0xf8));
            assert_eq!(base.add(8), Address::from_usize(0x108));
            assert_eq!(base.shift::<u64>(2), Address::from_usize(0x110));
        }
    }

    #[test]
    fn slot_cas() {
        let word = AtomicUsize::new(0);
        let slot = unsafe { LockWordSlot::new(Address::from_ref(&word)) };

        assert!(slot.compare_and_swap(0, 0x200));
        assert!(!slot.compare_and_swap(0, 0x400));
        assert_eq!(slot.load(Ordering::Relaxed), 0x200);

        slot.store(0, Ordering::Release);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }
}
