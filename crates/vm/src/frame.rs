//! 用户页框表
//!
//! 用户页框池是一块固定大小的物理内存，按物理页号索引。每个页框处于三种状态之一：
//!
//! - `Free`：在空闲链表中，可以被分配
//! - `Reserved`：已被取出但尚未登记到某个页上，只在持有池锁的一次操作中短暂存在
//! - `Resident`：正在承载某个进程的某个虚拟页
//!
//! 状态之外不存在页框，因此一个页框不可能被释放两次，也不可能被两个页同时持有。

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};

use defines::config::PAGE_SIZE;
use klocks::SpinMutex;

use crate::{
    address::{PhysPageNum, VirtPageNum},
    hal::{PageTable, ProcessId},
    page::PageState,
};

/// 页框到页的反向引用，不负责页的生命周期
pub struct FrameOwner {
    pub pid: ProcessId,
    pub vpn: VirtPageNum,
    pub page: Weak<SpinMutex<PageState>>,
    pub page_table: Arc<dyn PageTable>,
}

enum FrameSlot {
    Free,
    Reserved,
    Resident(FrameOwner),
}

pub struct FrameTable {
    memory: Vec<Box<[u8; PAGE_SIZE]>>,
    slots: Vec<FrameSlot>,
    free: Vec<PhysPageNum>,
    resident: usize,
    /// 时钟算法的指针
    hand: usize,
}

impl FrameTable {
    pub fn new(count: usize) -> Self {
        let mut memory = Vec::with_capacity(count);
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            memory.push(Box::new([0; PAGE_SIZE]));
            slots.push(FrameSlot::Free);
        }
        // 倒序放入，这样先分配出去的是低页号
        let free = (0..count).rev().map(PhysPageNum).collect();
        Self {
            memory,
            slots,
            free,
            resident: 0,
            hand: 0,
        }
    }

    /// 取出一个空闲页框并清零
    pub fn alloc(&mut self) -> Option<PhysPageNum> {
        let ppn = self.free.pop()?;
        debug_assert!(matches!(self.slots[ppn.0], FrameSlot::Free));
        self.slots[ppn.0] = FrameSlot::Reserved;
        self.memory[ppn.0].fill(0);
        Some(ppn)
    }

    /// 把 `Reserved` 的页框放回空闲链表
    ///
    /// # Panics
    ///
    /// 页框不是 `Reserved`，即重复释放或释放了仍在使用的页框
    pub fn dealloc(&mut self, ppn: PhysPageNum) {
        match self.slots[ppn.0] {
            FrameSlot::Reserved => {
                self.slots[ppn.0] = FrameSlot::Free;
                self.free.push(ppn);
            }
            FrameSlot::Free => panic!("frame {ppn:?} released twice"),
            FrameSlot::Resident(_) => panic!("frame {ppn:?} released while resident"),
        }
    }

    /// # Panics
    ///
    /// 页框不是 `Reserved`
    pub fn register(&mut self, ppn: PhysPageNum, owner: FrameOwner) {
        assert!(
            matches!(self.slots[ppn.0], FrameSlot::Reserved),
            "frame {ppn:?} registered without being reserved"
        );
        self.slots[ppn.0] = FrameSlot::Resident(owner);
        self.resident += 1;
    }

    /// 解除页框与页的关联，页框回到 `Reserved`
    ///
    /// # Panics
    ///
    /// 页框没有被登记
    pub fn unregister(&mut self, ppn: PhysPageNum) -> FrameOwner {
        match core::mem::replace(&mut self.slots[ppn.0], FrameSlot::Reserved) {
            FrameSlot::Resident(owner) => {
                self.resident -= 1;
                owner
            }
            _ => panic!("frame {ppn:?} is not registered"),
        }
    }

    pub fn release(&mut self, ppn: PhysPageNum) {
        self.unregister(ppn);
        self.dealloc(ppn);
    }

    pub fn owner(&self, ppn: PhysPageNum) -> Option<&FrameOwner> {
        match self.slots.get(ppn.0)? {
            FrameSlot::Resident(owner) => Some(owner),
            _ => None,
        }
    }

    /// 时钟（二次机会）算法选出一个牺牲页框
    ///
    /// 指针循环扫过所有页框，只看 `Resident` 的。访问位已置位的清零后放过，
    /// 否则选中。最多扫两圈。没有任何 `Resident` 页框时返回 `None`。
    pub fn select_victim(&mut self) -> Option<PhysPageNum> {
        if self.resident == 0 {
            return None;
        }
        let count = self.slots.len();
        for _ in 0..2 * count {
            let ppn = PhysPageNum(self.hand);
            self.hand = (self.hand + 1) % count;
            let FrameSlot::Resident(owner) = &self.slots[ppn.0] else {
                continue;
            };
            if owner.page_table.is_accessed(owner.vpn) {
                owner.page_table.clear_accessed(owner.vpn);
            } else {
                return Some(ppn);
            }
        }
        unreachable!("clock made two passes without a victim")
    }

    pub fn bytes(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE] {
        &self.memory[ppn.0]
    }

    pub fn bytes_mut(&mut self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        &mut self.memory[ppn.0]
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn resident_count(&self) -> usize {
        self.resident
    }
}
