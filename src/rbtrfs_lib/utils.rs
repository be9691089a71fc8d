#![allow(dead_code)]

extern crate core;

use core::mem::size_of;
use core::slice::{from_raw_parts, from_raw_parts_mut};

pub trait SliceExt {
    /// Casts an `&[T]` into an `&[U]`.
    ///
    /// # Safety
    ///
    /// The caller must ensure the following safety properties:
    ///
    ///   * The slice `self` contains valid elements of type `U`.
    ///   * The size of `T` and `U` are identical.
    ///   * The alignment of `T` is an integer multiple of the alignment of `U`.
    ///
    /// # Panics
    ///
    /// Panics if the size of `T` and `U` differ or if the alignment of `T` is
    /// not an integer multiple of `U`.
    unsafe fn cast<'a, U>(&'a self) -> &'a [U];

    /// Casts an `&mut [T]` into an `&mut [U]`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`SliceExt::cast`].
    unsafe fn cast_mut<'a, U>(&'a mut self) -> &'a mut [U];
}

fn calc_new_len<T, U>(slice: &[T]) -> usize {
    if size_of::<T>() > size_of::<U>() {
        assert!(size_of::<T>() % size_of::<U>() == 0);
        let factor = size_of::<T>() / size_of::<U>();
        slice.len() * factor
    } else if size_of::<U>() > size_of::<T>() {
        assert!(size_of::<U>() % size_of::<T>() == 0);
        let factor = size_of::<U>() / size_of::<T>();
        slice.len() / factor
    } else {
        slice.len()
    }
}

impl<T> SliceExt for [T] {
    unsafe fn cast<U>(&self) -> &[U] {
        assert_eq!(core::mem::align_of::<T>() % core::mem::align_of::<U>(), 0);

        let new_len = calc_new_len::<T, U>(self);
        let new_ptr = self.as_ptr() as *const U;
        from_raw_parts(new_ptr, new_len)
    }

    unsafe fn cast_mut<U>(&mut self) -> &mut [U] {
        assert_eq!(core::mem::align_of::<T>() % core::mem::align_of::<U>(), 0);

        let new_len = calc_new_len::<T, U>(self);
        let new_ptr = self.as_mut_ptr() as *mut U;
        from_raw_parts_mut(new_ptr, new_len)
    }
}

pub unsafe fn serialize_row<T: Sized>(src: &T) -> &[u8] {
    from_raw_parts((src as *const T) as *const u8, size_of::<T>())
}

pub unsafe fn deserialize_row<T>(src: &[u8]) -> T {
    std::ptr::read(src.as_ptr() as *const _)
}

/// Round `n` up to a multiple of `alignment` (power of two not required).
pub fn sector_align(n: u64, alignment: u64) -> u64 {
    if n % alignment != 0 {
        n + alignment - (n % alignment)
    } else {
        n
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(false).try_init();
}

#[macro_export]
macro_rules! get_offset {
    ($type:ty, $field:tt) => {{
        let dummy = ::core::mem::MaybeUninit::<$type>::uninit();
        let dummy_ptr = dummy.as_ptr();
        let member_ptr = unsafe { ::core::ptr::addr_of!((*dummy_ptr).$field) };
        member_ptr as usize - dummy_ptr as usize
    }};
}

#[macro_export]
macro_rules! prv {
    ($e:expr) => {{
        println!("{} = {:?}", stringify!($e), $e);
    }};
    ($($e:expr),+) => {{
        $(println!("{} = {:?}", stringify!($e), $e);)+
    }};
}
