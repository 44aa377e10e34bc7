//! 补充页表项
//!
//! 描述一个用户虚拟页的内容从何而来、当前在哪里，与它是否驻留无关

use std::sync::Arc as StdArc;

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use klocks::SpinMutex;
use triomphe::Arc;

use crate::{
    file::BackingFile,
    frame::{FrameId, FrameTable},
    page_table::PageTable,
    swap::{Swap, SwapSlot},
    VirtPageNum,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLocation {
    /// 刚分配，还不知道内容从何而来
    Init,
    /// 从文件读入
    FromFile,
    /// 全零
    ToBeZeroed,
    /// 驻留在帧中
    InFrame,
    /// 在交换区中
    InSwap,
}

/// 文件中的一段内容，页中其余部分为零
#[derive(Clone)]
pub struct FileBacking {
    pub file: StdArc<dyn BackingFile>,
    pub offset: usize,
    pub bytes: usize,
}

pub struct Page {
    vpn: VirtPageNum,
    writable: bool,
    /// 所属进程的页表，换出时要从中取消映射
    page_table: Arc<PageTable>,
    state: SpinMutex<PageState>,
}

struct PageState {
    location: PageLocation,
    frame: Option<FrameId>,
    swap_slot: Option<SwapSlot>,
    file: Option<FileBacking>,
    /// 页表项已被删除，不能再链接新的帧
    dead: bool,
}

impl Page {
    pub(crate) fn new(vpn: VirtPageNum, writable: bool, page_table: Arc<PageTable>) -> Self {
        Self {
            vpn,
            writable,
            page_table,
            state: SpinMutex::new(PageState {
                location: PageLocation::Init,
                frame: None,
                swap_slot: None,
                file: None,
                dead: false,
            }),
        }
    }

    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn location(&self) -> PageLocation {
        self.state.lock().location
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.state.lock().frame
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.state.lock().swap_slot
    }

    /// 以全零页作为初始内容
    pub fn set_zero_fill(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.location, PageLocation::Init);
        state.location = PageLocation::ToBeZeroed;
    }

    /// 以文件中 `offset` 处的 `bytes` 个字节作为初始内容
    pub fn set_file_backing(&self, file: StdArc<dyn BackingFile>, offset: usize, bytes: usize) {
        assert!(bytes <= PAGE_SIZE);
        let mut state = self.state.lock();
        assert_eq!(state.location, PageLocation::Init);
        state.location = PageLocation::FromFile;
        state.file = Some(FileBacking {
            file,
            offset,
            bytes,
        });
    }

    pub(crate) fn belongs_to(&self, page_table: &PageTable) -> bool {
        core::ptr::eq(&*self.page_table, page_table)
    }

    /// 读取并清除硬件页表中的访问位
    pub fn accessed_recently(&self) -> bool {
        self.page_table.take_accessed(self.vpn)
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// 标记该页已被删除，此后 [`Self::attach_frame`] 总是失败
    pub(crate) fn kill(&self) {
        self.state.lock().dead = true;
    }

    /// 仅当该页还没有帧时链接到 `fid`
    ///
    /// 已有帧时返回 `EBUSY`，页已被删除时返回 `EFAULT`
    pub(crate) fn attach_frame(&self, fid: FrameId) -> KResult<()> {
        let mut state = self.state.lock();
        if state.dead {
            return Err(errno::EFAULT);
        }
        if state.frame.is_some() {
            return Err(errno::EBUSY);
        }
        state.frame = Some(fid);
        Ok(())
    }

    pub(crate) fn detach_frame(&self, fid: FrameId) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.frame, Some(fid));
        state.frame = None;
    }

    pub(crate) fn take_swap_slot(&self) -> Option<SwapSlot> {
        self.state.lock().swap_slot.take()
    }

    /// 把页的内容读入 `data`，成功后该页标记为驻留
    ///
    /// 调用者持有该页刚链接上的帧
    pub(crate) fn materialize(&self, data: &mut [u8; PAGE_SIZE], swap: &Swap) -> KResult<()> {
        let (location, file, slot) = {
            let mut state = self.state.lock();
            debug_assert!(state.frame.is_some());
            if state.dead {
                return Err(errno::EFAULT);
            }
            // slot 由换入者拿走，读完即释放
            let slot = match state.location {
                PageLocation::InSwap => state.swap_slot.take(),
                _ => None,
            };
            (state.location, state.file.clone(), slot)
        };
        match location {
            PageLocation::Init => {
                debug!("page {:?} has no content source", self.vpn);
                return Err(errno::EFAULT);
            }
            PageLocation::FromFile => {
                let Some(backing) = file else {
                    unreachable!("file-backed page {:?} without a file", self.vpn);
                };
                data.fill(0);
                let read = backing
                    .file
                    .read_at(&mut data[..backing.bytes], backing.offset);
                if read != backing.bytes {
                    warn!(
                        "short read paging in {:?}: {read} of {} bytes",
                        self.vpn, backing.bytes
                    );
                    return Err(errno::EIO);
                }
            }
            PageLocation::ToBeZeroed => data.fill(0),
            PageLocation::InSwap => {
                let Some(slot) = slot else {
                    unreachable!("swapped page {:?} without a slot", self.vpn);
                };
                swap.swap_in(slot, data);
            }
            PageLocation::InFrame => unreachable!("page {:?} is already resident", self.vpn),
        }
        self.state.lock().location = PageLocation::InFrame;
        Ok(())
    }

    /// 将驻留在 `fid` 中的该页换出，解除页与帧之间的链接
    ///
    /// 调用者持有 `fid` 的锁。可写的页写入交换区；只读的页之后从文件重新读入，或是重新清零。
    /// 交换区已满时返回 `ENOSPC`，页保持原样。
    pub(crate) fn page_out(&self, frames: &FrameTable, fid: FrameId, swap: &Swap) -> KResult<()> {
        debug_assert_eq!(self.location(), PageLocation::InFrame);
        debug_assert_eq!(self.frame(), Some(fid));

        // 先拿到 slot，失败时还什么都没有改动
        let slot = if self.writable {
            Some(swap.alloc_slot()?)
        } else {
            None
        };
        // 必须先取消硬件映射，此后用户再也无法修改帧中的内容
        self.page_table.unmap(self.vpn);
        if let Some(slot) = slot {
            let mut buf = Box::new([0u8; PAGE_SIZE]);
            frames.with_data(fid, |data| buf.copy_from_slice(data));
            swap.write_slot(slot, &buf);
        }

        {
            let mut state = self.state.lock();
            state.location = match (slot, &state.file) {
                (Some(_), _) => PageLocation::InSwap,
                (None, Some(_)) => PageLocation::FromFile,
                (None, None) => PageLocation::ToBeZeroed,
            };
            state.swap_slot = slot;
            state.frame = None;
        }
        frames.clear_page(fid);
        debug!("page {:?} paged out to {:?}", self.vpn, self.location());
        Ok(())
    }
}
