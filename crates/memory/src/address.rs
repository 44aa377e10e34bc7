use core::{fmt, ops::Add};

use defines::config::{PAGE_OFFSET_MASK, PAGE_SIZE, PAGE_SIZE_BITS, USER_TOP};

/// 用户虚拟地址。`USER_TOP` 及以上属于内核
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    #[inline]
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_OFFSET_MASK
    }
    /// 向下取整页号
    #[inline]
    pub const fn vpn_floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }
    /// 当前虚地址所在的虚拟页号
    #[inline]
    pub const fn vpn(&self) -> VirtPageNum {
        self.vpn_floor()
    }
    /// 向上取整页号
    #[inline]
    pub const fn vpn_ceil(&self) -> VirtPageNum {
        VirtPageNum((self.0 + PAGE_SIZE - 1) >> PAGE_SIZE_BITS)
    }
    #[inline]
    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
    #[inline]
    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }
    #[inline]
    pub const fn is_user(&self) -> bool {
        self.0 < USER_TOP
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl<T> From<*const T> for VirtAddr {
    fn from(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

/// 虚拟页号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum(pub usize);

impl VirtPageNum {
    pub const fn page_start(&self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SIZE_BITS)
    }
}

impl Add<usize> for VirtPageNum {
    type Output = Self;
    fn add(self, len: usize) -> Self::Output {
        Self(self.0 + len)
    }
}
