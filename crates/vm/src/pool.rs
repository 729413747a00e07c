//! 页框池：页框表和交换表放在同一把锁下
//!
//! 取页框、驱逐、分配与释放交换槽都必须经过 [`Pool`]，
//! 所以同一时刻只有一个线程在挑选牺牲页框或改动交换位图。

use alloc::sync::Arc;

use defines::{
    config::PAGE_SIZE,
    error::{errno::ENOMEM, KResult},
};
use scopeguard::ScopeGuard;

use crate::{
    address::PhysPageNum,
    frame::{FrameOwner, FrameTable},
    hal::{BlockDevice, PageTable, ProcessId},
    page::Backing,
    spt::Page,
    swap::SwapTable,
};

pub struct Pool {
    pub frames: FrameTable,
    pub swap: SwapTable,
}

impl Pool {
    pub fn new(frames: usize, swap_disk: Arc<dyn BlockDevice>) -> Self {
        Self {
            frames: FrameTable::new(frames),
            swap: SwapTable::new(swap_disk),
        }
    }

    /// 取得一个清零的页框，必要时按时钟算法驱逐一个常驻页。
    ///
    /// 返回的页框处于 `Reserved` 状态，调用者要么登记它，要么 `dealloc` 它。
    pub fn acquire_frame(&mut self) -> KResult<PhysPageNum> {
        if let Some(ppn) = self.frames.alloc() {
            return Ok(ppn);
        }
        let Some(victim) = self.frames.select_victim() else {
            error!("frame pool is empty");
            return Err(ENOMEM);
        };
        self.evict(victim)?;
        self.frames.bytes_mut(victim).fill(0);
        Ok(victim)
    }

    /// 换出页框上的页，解除其硬件映射。成功后页框处于 `Reserved` 状态。
    ///
    /// 换出失败时什么都不改变，页仍然常驻。
    ///
    /// # Panics
    ///
    /// 页框没有登记，或者它的页已经不存在
    pub fn evict(&mut self, ppn: PhysPageNum) -> KResult<()> {
        let Pool { frames, swap } = self;
        let owner = frames
            .owner(ppn)
            .unwrap_or_else(|| panic!("evict unregistered frame {ppn:?}"));
        let page = owner
            .page
            .upgrade()
            .unwrap_or_else(|| panic!("frame {ppn:?} outlived page {:?}", owner.vpn));
        let mut state = page.lock();
        debug_assert_eq!(state.frame, Some(ppn));

        let dirty = owner.page_table.is_dirty(owner.vpn);
        state.backing.swap_out(frames.bytes(ppn), dirty, swap)?;
        owner.page_table.unmap(owner.vpn);
        state.frame = None;
        debug!(
            "evict {:?} of process {} from {ppn:?}",
            owner.vpn, owner.pid
        );
        drop(state);

        frames.unregister(ppn);
        Ok(())
    }

    /// 为 `page` 取得页框，建立映射，再由 `fill` 填入内容，最后登记。
    ///
    /// 任何一步失败，页框都会被放回空闲链表，映射也会撤销。
    pub fn install<F>(
        &mut self,
        page: &Page,
        pid: ProcessId,
        page_table: &Arc<dyn PageTable>,
        fill: F,
    ) -> KResult<PhysPageNum>
    where
        F: FnOnce(&mut Backing, &mut [u8; PAGE_SIZE], &mut SwapTable) -> KResult<()>,
    {
        let ppn = self.acquire_frame()?;
        let mut pool = scopeguard::guard(self, move |pool| pool.frames.dealloc(ppn));

        page_table.map(page.vpn, ppn, page.writable)?;
        let mut state = page.state.lock();
        let Pool { frames, swap } = &mut **pool;
        if let Err(e) = fill(&mut state.backing, frames.bytes_mut(ppn), swap) {
            page_table.unmap(page.vpn);
            return Err(e);
        }
        state.frame = Some(ppn);
        drop(state);

        let pool = ScopeGuard::into_inner(pool);
        pool.frames.register(
            ppn,
            FrameOwner {
                pid,
                vpn: page.vpn,
                page: Arc::downgrade(&page.state),
                page_table: Arc::clone(page_table),
            },
        );
        Ok(ppn)
    }
}
