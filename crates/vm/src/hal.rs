//! 虚存子系统依赖的外部协作者
//!
//! 文件系统、交换盘、硬件页表、调度器都由宿主内核实现，这里只约定最窄的接口。

use alloc::sync::Arc;

use defines::{config::SECTOR_SIZE, error::KResult};

use crate::address::{PhysPageNum, VirtPageNum};

pub type ProcessId = usize;

/// 一个打开的文件
///
/// 关闭即丢弃最后一个 `Arc<dyn File>`。
pub trait File: Send + Sync {
    /// 从 `offset` 开始读，返回实际读到的字节数，读到文件末尾时可能小于 `buf.len()`
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize>;
    /// 从 `offset` 开始写，返回实际写入的字节数
    fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<usize>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// 复制一个独立的句柄，与原句柄共享文件内容
    fn duplicate(&self) -> KResult<Arc<dyn File>>;
}

/// 交换盘，以 [`SECTOR_SIZE`] 为单位读写
pub trait BlockDevice: Send + Sync {
    fn block_count(&self) -> usize;
    fn read_block(&self, block_id: usize, buf: &mut [u8; SECTOR_SIZE]) -> KResult<()>;
    fn write_block(&self, block_id: usize, buf: &[u8; SECTOR_SIZE]) -> KResult<()>;
}

/// 某个进程的硬件页表
pub trait PageTable: Send + Sync {
    /// 建立映射。该页已被映射时返回错误
    fn map(&self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> KResult<()>;
    fn unmap(&self, vpn: VirtPageNum);
    fn translate(&self, vpn: VirtPageNum) -> Option<PhysPageNum>;
    fn is_dirty(&self, vpn: VirtPageNum) -> bool;
    fn is_accessed(&self, vpn: VirtPageNum) -> bool;
    fn clear_accessed(&self, vpn: VirtPageNum);
    fn clear_dirty(&self, vpn: VirtPageNum);
}

pub trait Scheduler: Send + Sync {
    fn current_process(&self) -> ProcessId;
    /// 以 `exit_code` 结束当前进程
    fn terminate_current(&self, exit_code: i32);
}
