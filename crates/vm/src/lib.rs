//! 按需调页的虚存管理
//!
//! 每个进程一张补充页表，记录每个虚拟页的内容在哪里：尚未产生、在交换区、在文件中，
//! 或者在某个页框里。所有进程共享一个固定大小的用户页框池，用时钟算法驱逐。

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod address;
mod fault;
mod frame;
pub mod hal;
mod manager;
mod mmap;
mod page;
mod pool;
mod space;
mod spt;
mod swap;

use alloc::sync::Arc;

use klocks::Once;

pub use self::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    fault::{PageFault, PageFaultFlags},
    manager::{MemInfo, Region, Vm, VmConfig},
    page::PageKind,
    space::{AddressSpace, MappingId, PageInfo, PageInfoKind},
};
use self::hal::{BlockDevice, Scheduler};

static VM: Once<Vm> = Once::new();

/// 初始化全局的虚存管理器。只有第一次调用生效
pub fn init(
    config: VmConfig,
    swap_disk: Arc<dyn BlockDevice>,
    scheduler: Arc<dyn Scheduler>,
) -> &'static Vm {
    VM.call_once(|| Vm::new(config, swap_disk, scheduler))
}

/// 全局的虚存管理器，未初始化时为 `None`
pub fn vm() -> Option<&'static Vm> {
    VM.get()
}
