//! 补充页表，记录进程每个虚拟页的后备

use alloc::{boxed::Box, sync::Arc};
use core::mem;

use defines::{
    config::PAGE_SIZE,
    error::{errno::EEXIST, KResult},
};
use hashbrown::HashMap;
use klocks::SpinMutex;
use smallvec::SmallVec;

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::{File, PageTable, ProcessId},
    page::{AnonPage, Backing, FilePage, FileRegion, Initializer, PageState},
    pool::Pool,
    space::MappingId,
};

/// 页描述符
pub struct Page {
    pub vpn: VirtPageNum,
    pub writable: bool,
    /// 属于哪个 mmap 映射
    pub mapping: Option<MappingId>,
    pub state: Arc<SpinMutex<PageState>>,
}

impl Page {
    pub fn new(
        vpn: VirtPageNum,
        writable: bool,
        mapping: Option<MappingId>,
        init: Initializer,
    ) -> Self {
        Self {
            vpn,
            writable,
            mapping,
            state: Arc::new(SpinMutex::new(PageState::new(init))),
        }
    }

    /// 销毁页：脏的文件页先写回，撤销映射，释放页框和交换槽。
    ///
    /// 写回失败时其余资源照样释放，错误返回给调用者。
    fn destroy(self, pool: &mut Pool, page_table: &dyn PageTable) -> KResult<()> {
        let mut state = self.state.lock();
        let mut result = Ok(());
        if let Some(ppn) = state.frame.take() {
            if let Backing::File(file) = &state.backing {
                let dirty = page_table.is_dirty(self.vpn);
                result = file
                    .write_back_if_dirty(pool.frames.bytes(ppn), dirty)
                    .map(drop);
            }
            page_table.unmap(self.vpn);
            pool.frames.release(ppn);
        }
        let backing = mem::replace(&mut state.backing, Backing::Uninit(Initializer::Zeroed));
        drop(state);
        backing.destroy(&mut pool.swap);
        result
    }
}

/// fork 时父进程文件句柄到子进程句柄的对应关系，同一个句柄只复制一次
#[derive(Default)]
pub struct FileDups(SmallVec<[(Arc<dyn File>, Arc<dyn File>); 4]>);

impl FileDups {
    pub fn get(&mut self, parent: &Arc<dyn File>) -> KResult<Arc<dyn File>> {
        let key = Arc::as_ptr(parent).cast::<()>();
        if let Some((_, child)) = self
            .0
            .iter()
            .find(|(p, _)| Arc::as_ptr(p).cast::<()>() == key)
        {
            return Ok(Arc::clone(child));
        }
        let child = parent.duplicate()?;
        self.0.push((Arc::clone(parent), Arc::clone(&child)));
        Ok(child)
    }

    fn region(&mut self, region: &FileRegion) -> KResult<FileRegion> {
        Ok(FileRegion {
            file: self.get(&region.file)?,
            ..region.clone()
        })
    }

    fn initializer(&mut self, init: &Initializer) -> KResult<Initializer> {
        Ok(match init {
            Initializer::Zeroed => Initializer::Zeroed,
            Initializer::Segment(region) => Initializer::Segment(self.region(region)?),
            Initializer::Mapping(region) => Initializer::Mapping(self.region(region)?),
        })
    }
}

/// fork 时从父进程页上取下的内容
enum Snapshot {
    Uninit(Initializer),
    Anon(Box<[u8; PAGE_SIZE]>),
    Swapped(Box<[u8; PAGE_SIZE]>),
    File(FileRegion, Option<Box<[u8; PAGE_SIZE]>>),
}

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: HashMap<VirtPageNum, Page>,
}

impl SupplementalPageTable {
    pub fn find(&self, va: VirtAddr) -> Option<&Page> {
        self.pages.get(&va.vpn_floor())
    }

    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.pages.contains_key(&vpn)
    }

    pub fn insert(&mut self, page: Page) -> KResult<()> {
        if self.pages.contains_key(&page.vpn) {
            return Err(EEXIST);
        }
        self.pages.insert(page.vpn, page);
        Ok(())
    }

    /// 删除页描述符并释放它的一切资源。页不存在时什么也不做
    pub fn remove(
        &mut self,
        vpn: VirtPageNum,
        pool: &mut Pool,
        page_table: &dyn PageTable,
    ) -> KResult<()> {
        match self.pages.remove(&vpn) {
            Some(page) => page.destroy(pool, page_table),
            None => Ok(()),
        }
    }

    /// 把 `parent` 的每一页深拷贝到 `self`，常驻页复制到新的页框里
    ///
    /// 失败时已经拷过来的页留在 `self` 中，由调用者拆除。
    pub fn copy_from(
        &mut self,
        parent: &Self,
        pool: &mut Pool,
        pid: ProcessId,
        page_table: &Arc<dyn PageTable>,
        files: &mut FileDups,
    ) -> KResult<()> {
        for page in parent.pages.values() {
            // 先把内容拷到缓冲区并放开父页的锁，后面取页框时可能驱逐到父页
            let snapshot = {
                let state = page.state.lock();
                match &state.backing {
                    Backing::Uninit(init) => Snapshot::Uninit(files.initializer(init)?),
                    Backing::Anon(anon) => {
                        let mut buf = Box::new([0; PAGE_SIZE]);
                        if let Some(ppn) = state.frame {
                            buf.copy_from_slice(pool.frames.bytes(ppn));
                            Snapshot::Anon(buf)
                        } else {
                            let slot = anon.slot.as_ref().unwrap_or_else(|| {
                                panic!("anonymous page {:?} has neither frame nor slot", page.vpn)
                            });
                            pool.swap.read(slot, &mut buf)?;
                            Snapshot::Swapped(buf)
                        }
                    }
                    Backing::File(file) => {
                        let content = state.frame.map(|ppn| Box::new(*pool.frames.bytes(ppn)));
                        Snapshot::File(files.region(&file.region)?, content)
                    }
                }
            };

            let (backing, content) = match snapshot {
                Snapshot::Uninit(init) => (Backing::Uninit(init), None),
                Snapshot::Anon(buf) => (Backing::Anon(AnonPage { slot: None }), Some(buf)),
                Snapshot::Swapped(buf) => {
                    let slot = pool.swap.swap_out(&buf)?;
                    (Backing::Anon(AnonPage { slot: Some(slot) }), None)
                }
                Snapshot::File(region, content) => (Backing::File(FilePage { region }), content),
            };
            let child = Page {
                vpn: page.vpn,
                writable: page.writable,
                mapping: page.mapping,
                state: Arc::new(SpinMutex::new(PageState {
                    backing,
                    frame: None,
                })),
            };
            self.insert(child)?;

            if let Some(buf) = content {
                let child = &self.pages[&page.vpn];
                pool.install(child, pid, page_table, |_, frame, _| {
                    frame.copy_from_slice(&*buf);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// 销毁所有页。写回失败只记录日志，资源照样释放
    pub fn teardown(&mut self, pool: &mut Pool, page_table: &dyn PageTable) {
        for (vpn, page) in self.pages.drain() {
            if let Err(e) = page.destroy(pool, page_table) {
                warn!("write back {vpn:?} failed on teardown: {e}");
            }
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// 属于映射 `id` 的所有页号
    pub fn mapping_pages(&self, id: MappingId) -> SmallVec<[VirtPageNum; 8]> {
        let mut vpns: SmallVec<[VirtPageNum; 8]> = self
            .pages
            .values()
            .filter(|page| page.mapping == Some(id))
            .map(|page| page.vpn)
            .collect();
        vpns.sort_unstable();
        vpns
    }
}
