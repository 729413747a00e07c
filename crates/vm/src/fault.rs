use bitflags::bitflags;
use defines::{
    config::STACK_SLACK,
    error::{
        errno::{EACCES, EFAULT},
        KResult,
    },
};

use crate::{address::VirtAddr, manager::Vm, page::Initializer, space::AddressSpace, spt::Page};

bitflags! {
    /// 缺页异常的原因
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultFlags: u8 {
        /// 页不存在。未置位说明是权限错误
        const NOT_PRESENT = 1 << 0;
        /// 写访问
        const WRITE = 1 << 1;
        /// 来自用户态
        const USER = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub addr: VirtAddr,
    pub flags: PageFaultFlags,
    /// 出错时用户态的栈指针，用于判断栈增长
    pub user_sp: VirtAddr,
}

impl PageFault {
    pub fn new(addr: VirtAddr, is_write: bool, not_present: bool, user_sp: VirtAddr) -> Self {
        let mut flags = PageFaultFlags::USER;
        flags.set(PageFaultFlags::WRITE, is_write);
        flags.set(PageFaultFlags::NOT_PRESENT, not_present);
        Self {
            addr,
            flags,
            user_sp,
        }
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(PageFaultFlags::WRITE)
    }

    pub fn not_present(&self) -> bool {
        self.flags.contains(PageFaultFlags::NOT_PRESENT)
    }
}

impl Vm {
    /// 处理当前进程的缺页。返回 `false` 时调用者应当结束该进程
    pub fn handle_page_fault(&self, fault: &PageFault) -> bool {
        let pid = self.scheduler.current_process();
        trace!("process {pid}: page fault {fault:?}");
        let Some(space) = self.address_space(pid) else {
            error!("process {pid} has no address space");
            return false;
        };
        match self.resolve_fault(&space, fault) {
            Ok(()) => true,
            Err(e) => {
                error!("process {pid}: fatal page fault at {:?}: {e}", fault.addr);
                false
            }
        }
    }

    /// 同 [`Vm::handle_page_fault`]，失败时直接以 -1 结束当前进程
    pub fn page_fault_or_terminate(&self, fault: &PageFault) -> bool {
        let handled = self.handle_page_fault(fault);
        if !handled {
            self.scheduler.terminate_current(-1);
        }
        handled
    }

    fn resolve_fault(&self, space: &AddressSpace, fault: &PageFault) -> KResult<()> {
        if !fault.addr.is_user() || !fault.not_present() {
            return Err(EFAULT);
        }
        let mut inner = space.inner.lock();
        if let Some(page) = inner.spt.find(fault.addr) {
            if fault.is_write() && !page.writable {
                return Err(EACCES);
            }
            return self.claim(space, page);
        }

        if !self.is_stack_growth(fault) {
            return Err(EFAULT);
        }
        let vpn = fault.addr.vpn_floor();
        debug!("process {}: grow stack to {vpn:?}", space.pid());
        inner
            .spt
            .insert(Page::new(vpn, true, None, Initializer::Zeroed))?;
        let page = inner.spt.find(fault.addr).ok_or(EFAULT)?;
        self.claim(space, page)
    }

    /// 写在栈的范围内，且不低于栈指针一个字以上
    fn is_stack_growth(&self, fault: &PageFault) -> bool {
        let top = self.config.user_stack;
        let bottom = top.saturating_sub(self.config.stack_limit);
        let addr = fault.addr.0;
        fault.is_write()
            && (bottom..top).contains(&addr)
            && addr >= fault.user_sp.0.saturating_sub(STACK_SLACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_from_bools() {
        let fault = PageFault::new(VirtAddr(0x1000), true, false, VirtAddr(0));
        assert!(fault.is_write());
        assert!(!fault.not_present());
        assert!(fault.flags.contains(PageFaultFlags::USER));

        let fault = PageFault::new(VirtAddr(0x1000), false, true, VirtAddr(0));
        assert_eq!(
            fault.flags,
            PageFaultFlags::USER | PageFaultFlags::NOT_PRESENT
        );
    }
}
