//! 模拟的硬件页表
//!
//! 虚拟页号映射到帧号，附带有效、可写、访问、脏四个标志位。
//! [`PageTable::access`] 扮演 MMU 的角色：要么完成一次访问并置上 A/D 位，要么报告缺页。

use bitflags::bitflags;
use hashbrown::HashMap;
use klocks::SpinMutex;

use crate::{frame::FrameId, VirtAddr, VirtPageNum};

bitflags! {
    /// page table entry flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const W = 1 << 1;
        const A = 1 << 2;
        const D = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableEntry {
    pub frame: FrameId,
    pub flags: PTEFlags,
}

impl PageTableEntry {
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PTEFlags::W)
    }
}

/// 一次失败的访存
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: VirtAddr,
    /// 页不存在；否则是权限错误
    pub not_present: bool,
    pub write: bool,
}

#[derive(Default)]
pub struct PageTable {
    entries: SpinMutex<HashMap<VirtPageNum, PageTableEntry>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立映射，A/D 位清零。已有映射会被覆盖
    pub fn map(&self, vpn: VirtPageNum, frame: FrameId, writable: bool) {
        let mut flags = PTEFlags::V;
        flags.set(PTEFlags::W, writable);
        self.entries
            .lock()
            .insert(vpn, PageTableEntry { frame, flags });
    }

    /// 若尚未映射则建立映射，返回是否新建
    pub fn map_if_absent(&self, vpn: VirtPageNum, frame: FrameId, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&vpn) {
            debug_assert_eq!(entry.frame, frame);
            return false;
        }
        let mut flags = PTEFlags::V;
        flags.set(PTEFlags::W, writable);
        entries.insert(vpn, PageTableEntry { frame, flags });
        true
    }

    /// 取消映射，返回原来的页表项
    pub fn unmap(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.lock().remove(&vpn)
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.lock().get(&vpn).copied()
    }

    /// 读取并清除访问位
    pub fn take_accessed(&self, vpn: VirtPageNum) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&vpn) else {
            return false;
        };
        let accessed = entry.flags.contains(PTEFlags::A);
        entry.flags.remove(PTEFlags::A);
        accessed
    }

    pub fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.entries
            .lock()
            .get(&vpn)
            .is_some_and(|entry| entry.flags.contains(PTEFlags::D))
    }

    /// 内核代替用户访问已映射的页时，同样置上 A/D 位
    pub fn touch(&self, vpn: VirtPageNum, write: bool) {
        if let Some(entry) = self.entries.lock().get_mut(&vpn) {
            entry.flags.insert(PTEFlags::A);
            if write {
                entry.flags.insert(PTEFlags::D);
            }
        }
    }

    /// 模拟 MMU 的一次访问
    ///
    /// 访问成功时在持有页表的情况下以帧号调用 `f`，因此访问不会与该页的换出交错
    pub fn access<R>(
        &self,
        addr: VirtAddr,
        write: bool,
        f: impl FnOnce(FrameId) -> R,
    ) -> Result<R, PageFault> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&addr.vpn_floor()) else {
            return Err(PageFault {
                addr,
                not_present: true,
                write,
            });
        };
        if write && !entry.is_writable() {
            return Err(PageFault {
                addr,
                not_present: false,
                write,
            });
        }
        entry.flags.insert(PTEFlags::A);
        if write {
            entry.flags.insert(PTEFlags::D);
        }
        Ok(f(entry.frame))
    }

    /// 已映射的页数
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}
