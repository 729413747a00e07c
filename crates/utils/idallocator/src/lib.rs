#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bitmap;
mod recycle;

pub use bitmap::BitmapAllocator;
pub use recycle::RecycleAllocator;
