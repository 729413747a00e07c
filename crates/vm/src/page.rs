//! 页描述符的后备状态机
//!
//! 一个虚拟页总是先以 [`Backing::Uninit`] 出现，第一次缺页时执行初始化器，
//! 之后变为匿名页或文件页，不会再变回去。

use alloc::sync::Arc;
use core::fmt;

use defines::{
    config::PAGE_SIZE,
    error::{errno::EIO, KResult},
};

use crate::{address::PhysPageNum, hal::File, swap::SwapSlot, swap::SwapTable};

/// 文件中的一段，最多一页
#[derive(Clone)]
pub struct FileRegion {
    pub file: Arc<dyn File>,
    pub offset: usize,
    /// 从文件读取的字节数，页内剩余部分填零
    pub read_bytes: usize,
}

impl FileRegion {
    /// 读入 `read_bytes` 字节，其余清零。读不满视为 I/O 错误
    pub fn load(&self, frame: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        let (head, tail) = frame.split_at_mut(self.read_bytes);
        let mut done = 0;
        while done < head.len() {
            let n = self.file.read_at(self.offset + done, &mut head[done..])?;
            if n == 0 {
                error!(
                    "short read at offset {:#x}: {done} of {} bytes",
                    self.offset, self.read_bytes
                );
                return Err(EIO);
            }
            done += n;
        }
        tail.fill(0);
        Ok(())
    }

    /// 把页的前 `read_bytes` 字节写回文件，不会延长文件
    pub fn write_back(&self, frame: &[u8; PAGE_SIZE]) -> KResult<()> {
        let data = &frame[..self.read_bytes];
        let mut done = 0;
        while done < data.len() {
            let n = self.file.write_at(self.offset + done, &data[done..])?;
            if n == 0 {
                return Err(EIO);
            }
            done += n;
        }
        Ok(())
    }
}

/// 未初始化页第一次缺页时如何产生内容
#[derive(Clone)]
pub enum Initializer {
    /// 全零的匿名页，用于栈和 bss
    Zeroed,
    /// 从可执行文件的段中加载，之后成为匿名页
    Segment(FileRegion),
    /// mmap 的文件页
    Mapping(FileRegion),
}

impl Initializer {
    pub fn target(&self) -> PageKind {
        match self {
            Initializer::Zeroed | Initializer::Segment(_) => PageKind::Anonymous,
            Initializer::Mapping(_) => PageKind::FileBacked,
        }
    }

    /// 填充页框并给出初始化后的后备
    fn initialize(&self, frame: &mut [u8; PAGE_SIZE]) -> KResult<Backing> {
        match self {
            // 页框在分配时已经清零
            Initializer::Zeroed => Ok(Backing::Anon(AnonPage { slot: None })),
            Initializer::Segment(region) => {
                region.load(frame)?;
                Ok(Backing::Anon(AnonPage { slot: None }))
            }
            Initializer::Mapping(region) => {
                region.load(frame)?;
                Ok(Backing::File(FilePage {
                    region: region.clone(),
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Anonymous,
    FileBacked,
}

pub struct AnonPage {
    /// 换出后内容所在的槽。常驻时为 `None`
    pub slot: Option<SwapSlot>,
}

pub struct FilePage {
    pub region: FileRegion,
}

impl FilePage {
    /// 页脏时写回文件。换出和 munmap 共用这一处
    pub fn write_back_if_dirty(&self, frame: &[u8; PAGE_SIZE], dirty: bool) -> KResult<bool> {
        if !dirty {
            return Ok(false);
        }
        self.region.write_back(frame)?;
        debug!(
            "write back {} bytes at offset {:#x}",
            self.region.read_bytes, self.region.offset
        );
        Ok(true)
    }
}

pub enum Backing {
    Uninit(Initializer),
    Anon(AnonPage),
    File(FilePage),
}

impl Backing {
    /// 把页的内容放进 `frame`。未初始化页会在此变为具体类型
    pub fn swap_in(&mut self, frame: &mut [u8; PAGE_SIZE], swap: &mut SwapTable) -> KResult<()> {
        match self {
            Backing::Uninit(init) => {
                let next = init.initialize(frame)?;
                *self = next;
            }
            Backing::Anon(anon) => {
                if let Some(slot) = anon.slot.take() {
                    if let Err(e) = swap.read(&slot, frame) {
                        anon.slot = Some(slot);
                        return Err(e);
                    }
                    swap.free(slot);
                }
            }
            Backing::File(file) => file.region.load(frame)?,
        }
        Ok(())
    }

    /// 保存页的内容，之后页框可以挪作他用。硬件映射由调用者解除
    ///
    /// # Panics
    ///
    /// 未初始化页不可能常驻，也就不可能被换出
    pub fn swap_out(
        &mut self,
        frame: &[u8; PAGE_SIZE],
        dirty: bool,
        swap: &mut SwapTable,
    ) -> KResult<()> {
        match self {
            Backing::Uninit(_) => panic!("swap out an uninitialized page"),
            Backing::Anon(anon) => {
                debug_assert!(anon.slot.is_none());
                anon.slot = Some(swap.swap_out(frame)?);
            }
            Backing::File(file) => {
                file.write_back_if_dirty(frame, dirty)?;
            }
        }
        Ok(())
    }

    /// 释放后备持有的资源。页框不归这里管
    pub fn destroy(self, swap: &mut SwapTable) {
        if let Backing::Anon(AnonPage { slot: Some(slot) }) = self {
            swap.free(slot);
        }
    }
}

/// 页描述符中会被驱逐路径修改的部分
///
/// 驱逐发生在任意进程的缺页处理中，因此单独加锁，并通过 `Weak` 被页框表引用。
/// `frame` 只在持有页框池锁时修改。
pub struct PageState {
    pub backing: Backing,
    pub frame: Option<PhysPageNum>,
}

impl PageState {
    pub fn new(init: Initializer) -> Self {
        Self {
            backing: Backing::Uninit(init),
            frame: None,
        }
    }
}

impl fmt::Debug for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.backing {
            Backing::Uninit(init) => match init {
                Initializer::Zeroed => "Uninit(Zeroed)",
                Initializer::Segment(_) => "Uninit(Segment)",
                Initializer::Mapping(_) => "Uninit(Mapping)",
            },
            Backing::Anon(_) => "Anon",
            Backing::File(_) => "File",
        };
        f.debug_struct("PageState")
            .field("backing", &backing)
            .field("frame", &self.frame)
            .finish()
    }
}
