//! 宿主机上模拟的硬件与内核协作者
#![allow(dead_code)]

use std::{
    cell::Cell,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use defines::{
    config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE},
    error::{
        errno::{EEXIST, EIO},
        KResult,
    },
};
use klocks::SpinMutex;
use vm::{
    hal::{BlockDevice, File, PageTable, ProcessId, Scheduler},
    AddressSpace, PageFault, PhysPageNum, VirtAddr, VirtPageNum, Vm, VmConfig,
};

struct Stderr;

impl simple_logger::Console for Stderr {
    fn write_str(&self, s: &str) {
        eprint!("{s}");
    }
}

pub fn init_log() {
    simple_logger::init_with_level(&Stderr, log::LevelFilter::Debug);
}

/// 内存里的交换盘
pub struct MemDisk {
    sectors: SpinMutex<Vec<[u8; SECTOR_SIZE]>>,
    pub fail_writes: AtomicBool,
}

impl MemDisk {
    pub fn with_slots(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: SpinMutex::new(vec![[0; SECTOR_SIZE]; slots * SECTORS_PER_PAGE]),
            fail_writes: AtomicBool::new(false),
        })
    }
}

impl BlockDevice for MemDisk {
    fn block_count(&self) -> usize {
        self.sectors.lock().len()
    }

    fn read_block(&self, block_id: usize, buf: &mut [u8; SECTOR_SIZE]) -> KResult<()> {
        buf.copy_from_slice(&self.sectors.lock()[block_id]);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8; SECTOR_SIZE]) -> KResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(EIO);
        }
        self.sectors.lock()[block_id] = *buf;
        Ok(())
    }
}

/// 同一个文件的所有句柄共享的东西
#[derive(Default)]
pub struct FileShared {
    pub data: SpinMutex<Vec<u8>>,
    pub dups: AtomicUsize,
    pub closes: AtomicUsize,
    /// 每次 `write_at` 的偏移
    pub writes: SpinMutex<Vec<usize>>,
}

impl FileShared {
    pub fn open_handles(&self) -> usize {
        self.dups.load(Ordering::Relaxed) - self.closes.load(Ordering::Relaxed)
    }
}

/// 内存里的文件句柄。每个句柄被丢弃时记一次关闭
pub struct MemFile {
    pub shared: Arc<FileShared>,
    counted: bool,
}

impl MemFile {
    /// 打开一个新文件，返回句柄和共享状态。这个句柄本身不计入 `dups`/`closes`
    pub fn open(content: Vec<u8>) -> (Arc<dyn File>, Arc<FileShared>) {
        let shared = Arc::new(FileShared {
            data: SpinMutex::new(content),
            ..Default::default()
        });
        let file = Arc::new(MemFile {
            shared: Arc::clone(&shared),
            counted: false,
        });
        (file, shared)
    }
}

impl File for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize> {
        let data = self.shared.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<usize> {
        let mut data = self.shared.data.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.shared.writes.lock().push(offset);
        Ok(buf.len())
    }

    fn len(&self) -> usize {
        self.shared.data.lock().len()
    }

    fn duplicate(&self) -> KResult<Arc<dyn File>> {
        self.shared.dups.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemFile {
            shared: Arc::clone(&self.shared),
            counted: true,
        }))
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        if self.counted {
            self.shared.closes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pte {
    pub ppn: PhysPageNum,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

/// 用哈希表模拟的页表，访问位与脏位由 [`Process`] 的读写设置
#[derive(Default)]
pub struct MockPageTable {
    entries: SpinMutex<HashMap<VirtPageNum, Pte>>,
}

impl MockPageTable {
    pub fn entry(&self, vpn: VirtPageNum) -> Option<Pte> {
        self.entries.lock().get(&vpn).copied()
    }

    pub fn touch(&self, vpn: VirtPageNum, write: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&vpn) {
            pte.accessed = true;
            pte.dirty |= write;
        }
    }

    pub fn mapped(&self) -> usize {
        self.entries.lock().len()
    }
}

impl PageTable for MockPageTable {
    fn map(&self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> KResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&vpn) {
            return Err(EEXIST);
        }
        entries.insert(
            vpn,
            Pte {
                ppn,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        Ok(())
    }

    fn unmap(&self, vpn: VirtPageNum) {
        self.entries.lock().remove(&vpn);
    }

    fn translate(&self, vpn: VirtPageNum) -> Option<PhysPageNum> {
        self.entry(vpn).map(|pte| pte.ppn)
    }

    fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.entry(vpn).is_some_and(|pte| pte.dirty)
    }

    fn is_accessed(&self, vpn: VirtPageNum) -> bool {
        self.entry(vpn).is_some_and(|pte| pte.accessed)
    }

    fn clear_accessed(&self, vpn: VirtPageNum) {
        if let Some(pte) = self.entries.lock().get_mut(&vpn) {
            pte.accessed = false;
        }
    }

    fn clear_dirty(&self, vpn: VirtPageNum) {
        if let Some(pte) = self.entries.lock().get_mut(&vpn) {
            pte.dirty = false;
        }
    }
}

thread_local! {
    /// 每个测试线程模拟一个 CPU，各自有当前进程
    static CURRENT: Cell<ProcessId> = const { Cell::new(0) };
}

#[derive(Default)]
pub struct MockScheduler {
    pub terminated: SpinMutex<Vec<(ProcessId, i32)>>,
}

impl MockScheduler {
    pub fn set_current(&self, pid: ProcessId) {
        CURRENT.with(|current| current.set(pid));
    }
}

impl Scheduler for MockScheduler {
    fn current_process(&self) -> ProcessId {
        CURRENT.with(Cell::get)
    }

    fn terminate_current(&self, exit_code: i32) {
        self.terminated
            .lock()
            .push((self.current_process(), exit_code));
    }
}

pub struct Machine {
    pub vm: Vm,
    pub disk: Arc<MemDisk>,
    pub scheduler: Arc<MockScheduler>,
}

impl Machine {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        Self::with_config(VmConfig::default().with_user_frames(frames), swap_slots)
    }

    pub fn with_config(config: VmConfig, swap_slots: usize) -> Self {
        init_log();
        let disk = MemDisk::with_slots(swap_slots);
        let scheduler = Arc::new(MockScheduler::default());
        let vm = Vm::new(config, disk.clone(), scheduler.clone());
        Self {
            vm,
            disk,
            scheduler,
        }
    }

    /// 创建一个进程的地址空间
    pub fn spawn(&self, pid: ProcessId) -> Process<'_> {
        let page_table = Arc::new(MockPageTable::default());
        let space = self
            .vm
            .create_address_space(pid, page_table.clone())
            .unwrap();
        Process {
            machine: self,
            pid,
            space,
            page_table,
            sp: Cell::new(self.vm.config().user_stack),
        }
    }

    pub fn fork(&self, parent: &Process<'_>, child_pid: ProcessId) -> KResult<Process<'_>> {
        let page_table = Arc::new(MockPageTable::default());
        let space = self
            .vm
            .fork_address_space(&parent.space, child_pid, page_table.clone())?;
        Ok(Process {
            machine: self,
            pid: child_pid,
            space,
            page_table,
            sp: Cell::new(parent.sp.get()),
        })
    }

    pub fn terminated(&self) -> Vec<(ProcessId, i32)> {
        self.scheduler.terminated.lock().clone()
    }
}

/// 一个进程，以及像硬件一样经由页表访问内存的 MMU
pub struct Process<'a> {
    pub machine: &'a Machine,
    pub pid: ProcessId,
    pub space: Arc<AddressSpace>,
    pub page_table: Arc<MockPageTable>,
    pub sp: Cell<usize>,
}

impl Process<'_> {
    fn vm(&self) -> &Vm {
        &self.machine.vm
    }

    fn fault(&self, va: VirtAddr, write: bool, not_present: bool) -> bool {
        self.machine.scheduler.set_current(self.pid);
        let fault = PageFault::new(va, write, not_present, VirtAddr(self.sp.get()));
        self.vm().page_fault_or_terminate(&fault)
    }

    /// 像 MMU 一样访问一个字节：查页表，缺页时进入缺页处理，然后重试
    ///
    /// 查到的页框在访问前可能已被别的线程换出并另作他用，
    /// 所以在页框池锁下再确认一次映射。
    fn access<R>(&self, va: usize, write: bool, f: impl Fn(&mut u8) -> R) -> Option<R> {
        let va = VirtAddr(va);
        let vpn = va.vpn_floor();
        loop {
            match self.page_table.entry(vpn) {
                Some(pte) if write && !pte.writable => {
                    // 写只读页是权限错误
                    self.fault(va, true, false);
                    return None;
                }
                Some(pte) => {
                    let done = self.vm().with_frame(pte.ppn, |bytes| {
                        if self.page_table.translate(vpn) != Some(pte.ppn) {
                            return None;
                        }
                        self.page_table.touch(vpn, write);
                        Some(f(&mut bytes[va.page_offset()]))
                    });
                    if let Some(Some(result)) = done {
                        return Some(result);
                    }
                }
                None => {
                    if !self.fault(va, write, true) {
                        return None;
                    }
                }
            }
        }
    }

    /// 读一个字节。缺页无法处理时返回 `None`
    pub fn load(&self, va: usize) -> Option<u8> {
        self.access(va, false, |byte| *byte)
    }

    /// 写一个字节。缺页无法处理时返回 `false`
    pub fn store(&self, va: usize, value: u8) -> bool {
        self.access(va, true, |byte| *byte = value).is_some()
    }

    pub fn write_bytes(&self, va: usize, data: &[u8]) -> bool {
        data.iter()
            .enumerate()
            .all(|(i, &b)| self.store(va + i, b))
    }

    pub fn read_bytes(&self, va: usize, len: usize) -> Option<Vec<u8>> {
        (0..len).map(|i| self.load(va + i)).collect()
    }

    /// 直接读页框内容，不经过缺页，也不设置访问位
    pub fn frame_bytes(&self, va: usize) -> Option<[u8; PAGE_SIZE]> {
        let pte = self.page_table.entry(VirtAddr(va).vpn_floor())?;
        self.vm().with_frame(pte.ppn, |bytes| *bytes)
    }
}
