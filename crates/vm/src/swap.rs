//! 交换区
//!
//! 交换盘按页切分为槽，一个槽占 [`SECTORS_PER_PAGE`] 个连续扇区，
//! 槽号即位置，盘上没有任何头部信息。
//!
//! [`SwapTable`] 只作为 [`Pool`](crate::pool::Pool) 的字段存在，
//! 所有操作都需要 `&mut SwapTable`，因此必然持有页框池的锁。

use alloc::sync::Arc;
use core::fmt;

use defines::{
    config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE},
    error::{errno::ENOSPC, KResult},
};
use idallocator::BitmapAllocator;

use crate::hal::BlockDevice;

type PageSectors = [[u8; SECTOR_SIZE]; SECTORS_PER_PAGE];

/// 交换槽。
///
/// 不可复制，谁持有它谁就是该槽内容的唯一所有者，归还时必须交回 [`SwapTable::free`]。
#[derive(PartialEq, Eq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(&self) -> usize {
        self.0
    }

    fn first_sector(&self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

pub struct SwapTable {
    disk: Arc<dyn BlockDevice>,
    slots: BitmapAllocator,
}

impl SwapTable {
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        let capacity = disk.block_count() / SECTORS_PER_PAGE;
        info!("swap: {capacity} slots");
        Self {
            disk,
            slots: BitmapAllocator::new(capacity),
        }
    }

    pub fn alloc(&mut self) -> KResult<SwapSlot> {
        let Some(index) = self.slots.alloc() else {
            warn!("swap: out of slots");
            return Err(ENOSPC);
        };
        debug!("swap: alloc slot {index}");
        Ok(SwapSlot(index))
    }

    /// # Panics
    ///
    /// 槽不处于已分配状态
    pub fn free(&mut self, slot: SwapSlot) {
        debug!("swap: free slot {}", slot.0);
        self.slots.dealloc(slot.0);
    }

    pub fn write(&mut self, slot: &SwapSlot, page: &[u8; PAGE_SIZE]) -> KResult<()> {
        debug_assert!(self.slots.is_allocated(slot.0));
        let sectors: &PageSectors = bytemuck::cast_ref(page);
        for (i, sector) in sectors.iter().enumerate() {
            self.disk.write_block(slot.first_sector() + i, sector)?;
        }
        Ok(())
    }

    pub fn read(&mut self, slot: &SwapSlot, page: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        debug_assert!(self.slots.is_allocated(slot.0));
        let sectors: &mut PageSectors = bytemuck::cast_mut(page);
        for (i, sector) in sectors.iter_mut().enumerate() {
            self.disk.read_block(slot.first_sector() + i, sector)?;
        }
        Ok(())
    }

    /// 分配一个槽并写入整页。写入失败时槽被归还
    pub fn swap_out(&mut self, page: &[u8; PAGE_SIZE]) -> KResult<SwapSlot> {
        let slot = self.alloc()?;
        if let Err(e) = self.write(&slot, page) {
            self.free(slot);
            return Err(e);
        }
        Ok(slot)
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn used(&self) -> usize {
        self.slots.used()
    }
}
