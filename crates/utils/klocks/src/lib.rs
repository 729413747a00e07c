//! 页框池、地址空间、进程表等共享状态所用的锁

#![cfg_attr(not(test), no_std)]

mod kspin;

pub use kspin::{SpinMutex, SpinMutexGuard};
pub use spin::{Lazy, Once};
