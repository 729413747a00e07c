//! 进程的地址空间：补充页表加上 mmap 映射表

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use idallocator::RecycleAllocator;
use klocks::SpinMutex;

use crate::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    hal::{File, PageTable, ProcessId},
    page::{Backing, PageKind},
    spt::SupplementalPageTable,
};

pub type MappingId = usize;

/// 一次 mmap 建立的映射
pub struct MmapRegion {
    pub start: VirtPageNum,
    pub pages: usize,
    /// mmap 时复制出的句柄，munmap 时随映射一起丢弃
    pub file: Arc<dyn File>,
}

pub struct SpaceInner {
    pub spt: SupplementalPageTable,
    pub mmaps: BTreeMap<MappingId, MmapRegion>,
    pub mapping_ids: RecycleAllocator,
}

impl Default for SpaceInner {
    fn default() -> Self {
        Self {
            spt: SupplementalPageTable::default(),
            mmaps: BTreeMap::new(),
            mapping_ids: RecycleAllocator::begin_with(1),
        }
    }
}

impl SpaceInner {
    /// `[start, start + pages)` 中是否已有页
    pub fn overlaps(&self, start: VirtPageNum, pages: usize) -> bool {
        start
            .range_to(start + pages)
            .any(|vpn| self.spt.contains(vpn))
    }
}

pub struct AddressSpace {
    pid: ProcessId,
    page_table: Arc<dyn PageTable>,
    pub(crate) inner: SpinMutex<SpaceInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInfoKind {
    /// 尚未初始化，第一次缺页后会成为 `target`
    Uninit { target: PageKind },
    Anonymous,
    FileBacked,
}

/// 某个虚拟页当前的状况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub kind: PageInfoKind,
    pub writable: bool,
    pub frame: Option<PhysPageNum>,
    pub swap_slot: Option<usize>,
    pub mapping: Option<MappingId>,
}

impl AddressSpace {
    pub(crate) fn new(pid: ProcessId, page_table: Arc<dyn PageTable>) -> Self {
        Self {
            pid,
            page_table,
            inner: SpinMutex::new(SpaceInner::default()),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn page_table(&self) -> &Arc<dyn PageTable> {
        &self.page_table
    }

    pub fn page_info(&self, va: VirtAddr) -> Option<PageInfo> {
        let inner = self.inner.lock();
        let page = inner.spt.find(va)?;
        let state = page.state.lock();
        let (kind, swap_slot) = match &state.backing {
            Backing::Uninit(init) => (
                PageInfoKind::Uninit {
                    target: init.target(),
                },
                None,
            ),
            Backing::Anon(anon) => (
                PageInfoKind::Anonymous,
                anon.slot.as_ref().map(|slot| slot.index()),
            ),
            Backing::File(_) => (PageInfoKind::FileBacked, None),
        };
        Some(PageInfo {
            kind,
            writable: page.writable,
            frame: state.frame,
            swap_slot,
            mapping: page.mapping,
        })
    }

    /// 已声明的页数
    pub fn page_count(&self) -> usize {
        self.inner.lock().spt.page_count()
    }

    /// 当前所有 mmap 映射及其起始地址
    pub fn mappings(&self) -> Vec<(MappingId, VirtAddr)> {
        self.inner
            .lock()
            .mmaps
            .iter()
            .map(|(&id, region)| (id, region.start.page_start()))
            .collect()
    }
}
