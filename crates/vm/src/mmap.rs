//! 文件映射
//!
//! mmap 为区域内每页声明一个懒加载的文件页，所有页共享同一个复制出的句柄和映射号；
//! munmap 写回脏页后拆除整个映射。文件页被驱逐时也走同一条写回路径。

use alloc::sync::Arc;

use defines::{
    config::PAGE_SIZE,
    error::{
        errno::{EEXIST, EINVAL},
        KResult,
    },
};

use crate::{
    address::VirtAddr,
    hal::File,
    manager::{check_user_range, Vm},
    page::{FileRegion, Initializer},
    space::{AddressSpace, MappingId, MmapRegion},
    spt::Page,
};

impl Vm {
    /// 把 `file` 从 `offset` 开始的内容映射到 `[va, va + len)`
    ///
    /// 超出文件末尾的部分读为零，写回时也不会延长文件。
    pub fn mmap(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        len: usize,
        writable: bool,
        file: &Arc<dyn File>,
        offset: usize,
    ) -> KResult<MappingId> {
        let pages = check_user_range(va, len).inspect_err(|_| {
            warn!("mmap: bad range {va:?} + {len:#x}");
        })?;
        if offset % PAGE_SIZE != 0 || offset.checked_add(len).is_none() || file.is_empty() {
            warn!("mmap: bad offset {offset:#x} or empty file");
            return Err(EINVAL);
        }
        let start = va.vpn_floor();
        let mut inner = space.inner.lock();
        if inner.overlaps(start, pages) {
            warn!("mmap: {va:?} + {len:#x} overlaps existing pages");
            return Err(EEXIST);
        }

        let file = file.duplicate()?;
        let file_len = file.len();
        let id = inner.mapping_ids.alloc();
        for (i, vpn) in start.range_to(start + pages).enumerate() {
            let page_offset = i * PAGE_SIZE;
            let read_bytes = (len - page_offset)
                .min(PAGE_SIZE)
                .min(file_len.saturating_sub(offset + page_offset));
            let region = FileRegion {
                file: Arc::clone(&file),
                offset: offset + page_offset,
                read_bytes,
            };
            inner.spt.insert(Page::new(
                vpn,
                writable,
                Some(id),
                Initializer::Mapping(region),
            ))?;
        }
        inner.mmaps.insert(id, MmapRegion { start, pages, file });
        debug!(
            "process {}: mmap #{id} at {va:?}, {pages} pages from offset {offset:#x}",
            space.pid()
        );
        Ok(id)
    }

    /// 拆除 `va` 所在的映射
    ///
    /// 映射中的每一页都会被移除，即使某页写回失败；第一个写回错误会被返回。
    pub fn munmap(&self, space: &AddressSpace, va: VirtAddr) -> KResult<()> {
        let mut inner = space.inner.lock();
        let id = inner
            .spt
            .find(va)
            .and_then(|page| page.mapping)
            .ok_or(EINVAL)?;
        let vpns = inner.spt.mapping_pages(id);

        let mut result = Ok(());
        {
            let mut pool = self.pool.lock();
            for vpn in vpns {
                let removed = inner
                    .spt
                    .remove(vpn, &mut pool, space.page_table().as_ref());
                if let Err(e) = removed {
                    warn!("munmap #{id}: write back {vpn:?} failed: {e}");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        inner.mapping_ids.dealloc(id);
        // 丢弃映射持有的句柄
        inner.mmaps.remove(&id);
        debug!("process {}: munmap #{id}", space.pid());
        result
    }
}
