//! 虚存管理器
//!
//! 持有全局的页框池和进程地址空间表，对外提供声明区域、缺页处理、
//! 预取、驱逐、fork 与回收等操作。
//!
//! 锁的顺序：地址空间 -> 页框池 -> 页状态。进程表的锁总是单独持有。

use alloc::sync::Arc;

use defines::{
    config::{PAGE_SIZE, STACK_LIMIT, USER_END, USER_FRAMES, USER_STACK},
    error::{
        errno::{EACCES, EEXIST, EFAULT, EINVAL},
        KResult,
    },
};
use hashbrown::HashMap;
use idallocator::RecycleAllocator;
use klocks::SpinMutex;

use crate::{
    address::{PhysPageNum, VirtAddr},
    hal::{BlockDevice, File, PageTable, ProcessId, Scheduler},
    page::{FileRegion, Initializer},
    pool::Pool,
    space::{AddressSpace, MmapRegion, SpaceInner},
    spt::{FileDups, Page},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// 用户页框池的页框数
    pub user_frames: usize,
    /// 用户栈顶
    pub user_stack: usize,
    /// 栈最多能长到多大
    pub stack_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: USER_FRAMES,
            user_stack: USER_STACK,
            stack_limit: STACK_LIMIT,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(mut self, user_frames: usize) -> Self {
        self.user_frames = user_frames;
        self
    }

    pub fn with_user_stack(mut self, user_stack: usize) -> Self {
        self.user_stack = user_stack;
        self
    }

    pub fn with_stack_limit(mut self, stack_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self
    }
}

/// 声明一段区域时，页的内容从哪里来
pub enum Region {
    /// 全零，如栈和 bss
    Zeroed,
    /// 从文件 `offset` 处读 `read_bytes` 字节，其余填零，如可执行文件的段
    Segment {
        file: Arc<dyn File>,
        offset: usize,
        read_bytes: usize,
    },
}

/// 页框与交换区的使用情况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_frames: usize,
    pub free_frames: usize,
    pub resident_frames: usize,
    pub swap_slots: usize,
    pub swap_used: usize,
}

pub struct Vm {
    pub(crate) pool: SpinMutex<Pool>,
    spaces: SpinMutex<HashMap<ProcessId, Arc<AddressSpace>>>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) config: VmConfig,
}

/// 检查 `[va, va + len)` 是页对齐、非空且完全在用户空间内的区域，返回页数
pub(crate) fn check_user_range(va: VirtAddr, len: usize) -> KResult<usize> {
    if len == 0 || !va.is_aligned() || !va.is_user() {
        return Err(EINVAL);
    }
    match va.checked_add(len) {
        Some(end) if end.0 <= USER_END => Ok(len.div_ceil(PAGE_SIZE)),
        _ => Err(EINVAL),
    }
}

impl Vm {
    pub fn new(
        config: VmConfig,
        swap_disk: Arc<dyn BlockDevice>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        info!("vm: {} user frames", config.user_frames);
        Self {
            pool: SpinMutex::new(Pool::new(config.user_frames, swap_disk)),
            spaces: SpinMutex::new(HashMap::new()),
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn create_address_space(
        &self,
        pid: ProcessId,
        page_table: Arc<dyn PageTable>,
    ) -> KResult<Arc<AddressSpace>> {
        let mut spaces = self.spaces.lock();
        if spaces.contains_key(&pid) {
            return Err(EEXIST);
        }
        let space = Arc::new(AddressSpace::new(pid, page_table));
        spaces.insert(pid, Arc::clone(&space));
        Ok(space)
    }

    pub fn address_space(&self, pid: ProcessId) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&pid).cloned()
    }

    /// 声明一段懒加载的区域，每页都是未初始化页
    pub fn declare_region(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        len: usize,
        writable: bool,
        region: Region,
    ) -> KResult<()> {
        let pages = check_user_range(va, len)?;
        let start = va.vpn_floor();
        let mut inner = space.inner.lock();
        if inner.overlaps(start, pages) {
            return Err(EEXIST);
        }
        // 同一段共用一个复制出的句柄
        let segment = match region {
            Region::Zeroed => None,
            Region::Segment {
                file,
                offset,
                read_bytes,
            } => {
                if offset % PAGE_SIZE != 0
                    || read_bytes > len
                    || offset.checked_add(len).is_none()
                {
                    return Err(EINVAL);
                }
                Some((file.duplicate()?, offset, read_bytes))
            }
        };
        for (i, vpn) in start.range_to(start + pages).enumerate() {
            let init = match &segment {
                Some((file, offset, read_bytes)) => {
                    let read = read_bytes.saturating_sub(i * PAGE_SIZE).min(PAGE_SIZE);
                    if read == 0 {
                        Initializer::Zeroed
                    } else {
                        Initializer::Segment(FileRegion {
                            file: Arc::clone(file),
                            offset: offset + i * PAGE_SIZE,
                            read_bytes: read,
                        })
                    }
                }
                None => Initializer::Zeroed,
            };
            inner.spt.insert(Page::new(vpn, writable, None, init))?;
        }
        trace!("process {}: declare {va:?} with {pages} pages", space.pid());
        Ok(())
    }

    /// 在栈顶下方声明第一页栈并立即装入，返回初始栈指针
    pub fn setup_stack(&self, space: &AddressSpace) -> KResult<VirtAddr> {
        let top = VirtAddr(self.config.user_stack);
        let first = top - PAGE_SIZE;
        self.declare_region(space, first, PAGE_SIZE, true, Region::Zeroed)?;
        self.claim_page(space, first)?;
        Ok(top)
    }

    /// 让页常驻：取页框、建立映射、填入内容。已常驻时什么也不做
    ///
    /// 调用者持有 `space` 的锁，`page` 来自其补充页表。
    pub(crate) fn claim(&self, space: &AddressSpace, page: &Page) -> KResult<()> {
        let mut pool = self.pool.lock();
        if page.state.lock().frame.is_some() {
            return Ok(());
        }
        let ppn = pool.install(page, space.pid(), space.page_table(), |backing, frame, swap| {
            backing.swap_in(frame, swap)
        })?;
        trace!("process {}: claim {:?} -> {ppn:?}", space.pid(), page.vpn);
        Ok(())
    }

    pub fn claim_page(&self, space: &AddressSpace, va: VirtAddr) -> KResult<()> {
        let inner = space.inner.lock();
        let page = inner.spt.find(va).ok_or(EFAULT)?;
        self.claim(space, page)
    }

    /// 在系统调用访问用户缓冲区之前，让 `[va, va + len)` 的每一页都常驻
    pub fn prefault(&self, space: &AddressSpace, va: VirtAddr, len: usize, write: bool) -> KResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len).ok_or(EFAULT)?;
        let inner = space.inner.lock();
        for vpn in va.vpn_floor().range_to(end.vpn_ceil()) {
            let page = inner.spt.find(vpn.page_start()).ok_or(EFAULT)?;
            if write && !page.writable {
                return Err(EACCES);
            }
            self.claim(space, page)?;
        }
        Ok(())
    }

    /// 驱逐 `va` 所在的页。页未声明或不常驻时返回 `Ok(false)`
    pub fn evict_page(&self, space: &AddressSpace, va: VirtAddr) -> KResult<bool> {
        let inner = space.inner.lock();
        let Some(page) = inner.spt.find(va) else {
            return Ok(false);
        };
        let mut pool = self.pool.lock();
        let Some(ppn) = page.state.lock().frame else {
            return Ok(false);
        };
        pool.evict(ppn)?;
        pool.frames.dealloc(ppn);
        Ok(true)
    }

    /// 为子进程复制一份地址空间。常驻页的内容被复制到新页框，不做写时复制
    pub fn fork_address_space(
        &self,
        parent: &AddressSpace,
        child_pid: ProcessId,
        child_page_table: Arc<dyn PageTable>,
    ) -> KResult<Arc<AddressSpace>> {
        let child = self.create_address_space(child_pid, child_page_table)?;
        if let Err(e) = self.copy_space(parent, &child) {
            warn!("fork {} -> {child_pid} failed: {e}", parent.pid());
            self.teardown_address_space(&child);
            return Err(e);
        }
        debug!(
            "fork {} -> {child_pid}: {} pages",
            parent.pid(),
            child.page_count()
        );
        Ok(child)
    }

    fn copy_space(&self, parent: &AddressSpace, child: &AddressSpace) -> KResult<()> {
        let parent_inner = parent.inner.lock();
        let mut child_inner = child.inner.lock();
        let mut files = FileDups::default();
        for (&id, region) in &parent_inner.mmaps {
            let file = files.get(&region.file)?;
            child_inner.mmaps.insert(
                id,
                MmapRegion {
                    start: region.start,
                    pages: region.pages,
                    file,
                },
            );
        }
        child_inner.mapping_ids = parent_inner.mapping_ids.clone();

        let mut pool = self.pool.lock();
        child_inner.spt.copy_from(
            &parent_inner.spt,
            &mut pool,
            child.pid(),
            child.page_table(),
            &mut files,
        )
    }

    /// 回收地址空间：写回脏的文件页，释放页框和交换槽，关闭复制的句柄，并从进程表中注销
    pub fn teardown_address_space(&self, space: &AddressSpace) {
        {
            let mut spaces = self.spaces.lock();
            if spaces
                .get(&space.pid())
                .is_some_and(|s| core::ptr::eq(Arc::as_ptr(s), space))
            {
                spaces.remove(&space.pid());
            }
        }
        let mut inner = space.inner.lock();
        let SpaceInner {
            spt,
            mmaps,
            mapping_ids,
        } = &mut *inner;
        let pages = spt.page_count();
        spt.teardown(&mut self.pool.lock(), space.page_table().as_ref());
        mmaps.clear();
        *mapping_ids = RecycleAllocator::begin_with(1);
        debug!("process {}: teardown {pages} pages", space.pid());
    }

    pub fn meminfo(&self) -> MemInfo {
        let pool = self.pool.lock();
        MemInfo {
            total_frames: pool.frames.total(),
            free_frames: pool.frames.free_count(),
            resident_frames: pool.frames.resident_count(),
            swap_slots: pool.swap.capacity(),
            swap_used: pool.swap.used(),
        }
    }

    /// 在页框池锁下访问一个常驻页框的内容，页框未被使用时返回 `None`
    pub fn with_frame<R>(
        &self,
        ppn: PhysPageNum,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Option<R> {
        let mut pool = self.pool.lock();
        pool.frames.owner(ppn)?;
        Some(f(pool.frames.bytes_mut(ppn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_range_checks() {
        assert_eq!(check_user_range(VirtAddr(0x1000), 1), Ok(1));
        assert_eq!(check_user_range(VirtAddr(0x1000), 0x2001), Ok(3));
        assert_eq!(check_user_range(VirtAddr(0), 0x1000), Err(EINVAL));
        assert_eq!(check_user_range(VirtAddr(0x1800), 0x1000), Err(EINVAL));
        assert_eq!(check_user_range(VirtAddr(0x1000), 0), Err(EINVAL));
        assert_eq!(
            check_user_range(VirtAddr(USER_END - PAGE_SIZE), PAGE_SIZE),
            Ok(1)
        );
        assert_eq!(
            check_user_range(VirtAddr(USER_END - PAGE_SIZE), PAGE_SIZE + 1),
            Err(EINVAL)
        );
        assert_eq!(check_user_range(VirtAddr(0x1000), usize::MAX), Err(EINVAL));
    }

    #[test]
    fn config_builder() {
        let config = VmConfig::default().with_user_frames(4).with_stack_limit(PAGE_SIZE);
        assert_eq!(config.user_frames, 4);
        assert_eq!(config.stack_limit, PAGE_SIZE);
        assert_eq!(config.user_stack, USER_STACK);
    }
}
