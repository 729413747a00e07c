use core::{
    fmt,
    ops::{Add, Sub},
};

use defines::config::{PAGE_OFFSET_MASK, PAGE_SIZE, PAGE_SIZE_BITS, USER_END, USER_START};

/// 用户虚拟地址
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_OFFSET_MASK
    }

    pub const fn is_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// 是否落在用户地址空间内。0 页不属于用户
    pub const fn is_user(&self) -> bool {
        self.0 >= USER_START && self.0 < USER_END
    }

    /// 向下取整页号
    pub const fn vpn_floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }

    /// 向上取整页号
    pub const fn vpn_ceil(&self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    pub const fn checked_add(self, len: usize) -> Option<Self> {
        match self.0.checked_add(len) {
            Some(end) => Some(Self(end)),
            None => None,
        }
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for VirtAddr {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA:{:#x}", self.0)
    }
}

/// 虚拟页号，也是补充页表的键
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum(pub usize);

impl VirtPageNum {
    pub const fn page_start(&self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SIZE_BITS)
    }

    pub const fn with_offset(self, offset: usize) -> VirtAddr {
        VirtAddr(self.page_start().0 + offset)
    }

    /// `[self, end)` 中的每个页号
    pub fn range_to(self, end: Self) -> impl Iterator<Item = VirtPageNum> + Clone {
        (self.0..end.0).map(VirtPageNum)
    }
}

impl Add<usize> for VirtPageNum {
    type Output = Self;

    fn add(self, len: usize) -> Self::Output {
        Self(self.0 + len)
    }
}

impl Sub<usize> for VirtPageNum {
    type Output = Self;

    fn sub(self, len: usize) -> Self::Output {
        Self(self.0 - len)
    }
}

impl fmt::Debug for VirtPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VPN:{:#x}", self.0)
    }
}

/// 用户页框池中的物理页号，从 0 开始编号
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysPageNum(pub usize);

impl fmt::Debug for PhysPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PPN:{}", self.0)
    }
}
