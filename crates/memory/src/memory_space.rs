use std::{collections::BTreeMap, sync::Arc as StdArc};

use defines::{
    config::{PAGE_SIZE, STACK_MAX, STACK_SLACK, USER_TOP},
    error::{errno, KResult},
};
use klocks::SpinMutex;
use triomphe::Arc;

use crate::{
    file::BackingFile,
    frame::FrameId,
    page::{Page, PageLocation},
    page_table::{PageFault, PageTable},
    VirtAddr, VirtPageNum, Vm,
};

/// 进程的用户地址空间，也就是它的补充页表
///
/// 表本身的锁只保护插入、查找与删除，换入换出依靠帧锁
pub struct MemorySpace {
    vm: Arc<Vm>,
    page_table: Arc<PageTable>,
    pages: SpinMutex<BTreeMap<VirtPageNum, Arc<Page>>>,
}

impl MemorySpace {
    pub fn new(vm: Arc<Vm>) -> Self {
        Self {
            vm,
            page_table: Arc::new(PageTable::new()),
            pages: SpinMutex::new(BTreeMap::new()),
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// 在 `va` 所在的页新建一个 `Init` 状态的页表项
    ///
    /// 该处已有页表项时返回 `EEXIST`
    pub fn allocate(&self, va: VirtAddr, writable: bool) -> KResult<Arc<Page>> {
        if !va.is_user() {
            return Err(errno::EFAULT);
        }
        let vpn = va.vpn_floor();
        let mut pages = self.pages.lock();
        if pages.contains_key(&vpn) {
            return Err(errno::EEXIST);
        }
        let page = Arc::new(Page::new(vpn, writable, self.page_table.clone()));
        pages.insert(vpn, page.clone());
        Ok(page)
    }

    /// 已有的页表项，不考虑栈增长
    pub fn page(&self, va: VirtAddr) -> Option<Arc<Page>> {
        self.pages.lock().get(&va.vpn_floor()).cloned()
    }

    /// 找到 `va` 所在页的页表项
    ///
    /// 找不到时，若 `va` 落在栈区且不低于栈指针 `esp` 下方 `STACK_SLACK` 字节，
    /// 则视为栈增长，新建一个全零的可写页
    pub fn page_for_addr(&self, va: VirtAddr, esp: Option<VirtAddr>) -> Option<Arc<Page>> {
        if !va.is_user() {
            return None;
        }
        if let Some(page) = self.page(va) {
            return Some(page);
        }
        let esp = esp?;
        if va.0 < USER_TOP - STACK_MAX || va.0 + STACK_SLACK < esp.0 {
            return None;
        }
        match self.allocate(va, true) {
            Ok(page) => {
                page.set_zero_fill();
                debug!("stack grows to {:#x}", va.vpn_floor().page_start().0);
                Some(page)
            }
            // 同一进程的另一个线程刚刚为它分配了页
            Err(_) => self.page(va),
        }
    }

    /// 钉住 `page`：必要时换入，返回时持有它所在帧的锁，并且已建立硬件映射
    fn pin(&self, page: &Arc<Page>) -> KResult<FrameId> {
        let frames = &self.vm.frames;
        let fid = loop {
            if let Some(fid) = frames.lock_page_frame(page) {
                break fid;
            }
            match self.do_page_in(page) {
                Ok(fid) => break fid,
                // 被别的线程抢先换入了，转而锁住已有的帧
                Err(errno::EBUSY) => continue,
                Err(err) => return Err(err),
            }
        };
        self.page_table
            .map_if_absent(page.vpn(), fid, page.is_writable());
        Ok(fid)
    }

    /// 为没有帧的 `page` 分配帧并读入内容。失败时不会留下已锁住的帧
    fn do_page_in(&self, page: &Arc<Page>) -> KResult<FrameId> {
        let frames = &self.vm.frames;
        let fid = frames.alloc_and_lock(page, &self.vm.swap)?;
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        if let Err(err) = page.materialize(&mut buf, &self.vm.swap) {
            frames.free(fid);
            return Err(err);
        }
        frames.with_data(fid, |data| data.copy_from_slice(&*buf));
        trace!("page {:?} paged into frame {}", page.vpn(), fid.0);
        Ok(fid)
    }

    /// 缺页处理的入口
    pub fn page_in(&self, fault_addr: VirtAddr, esp: Option<VirtAddr>) -> KResult<()> {
        let page = self.page_for_addr(fault_addr, esp).ok_or(errno::EFAULT)?;
        let fid = self.pin(&page)?;
        self.vm.frames.unlock(fid);
        Ok(())
    }

    /// 钉住 `va` 所在的页，使内核可以安全地访问它。必须与 [`Self::page_unlock`] 成对调用
    ///
    /// 要写一个只读页时返回 `EACCES`
    pub fn page_lock(&self, va: VirtAddr, will_write: bool, esp: Option<VirtAddr>) -> KResult<()> {
        let page = self.page_for_addr(va, esp).ok_or(errno::EFAULT)?;
        if will_write && !page.is_writable() {
            return Err(errno::EACCES);
        }
        self.pin(&page)?;
        Ok(())
    }

    #[track_caller]
    pub fn page_unlock(&self, va: VirtAddr) {
        let fid = self.pinned_frame(va);
        self.vm.frames.unlock(fid);
    }

    /// 访问已被当前线程钉住的页
    ///
    /// `f` 拿到的是页内容的副本，可以在其中阻塞（比如读文件）。
    /// `write` 为真时副本在 `f` 返回后写回帧中，否则对它的修改被丢弃
    #[track_caller]
    pub fn with_pinned<R>(
        &self,
        va: VirtAddr,
        write: bool,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> R {
        let frames = &self.vm.frames;
        let fid = self.pinned_frame(va);
        self.page_table.touch(va.vpn_floor(), write);
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        frames.with_data(fid, |data| buf.copy_from_slice(data));
        let ret = f(&mut *buf);
        if write {
            frames.with_data(fid, |data| data.copy_from_slice(&*buf));
        }
        ret
    }

    #[track_caller]
    fn pinned_frame(&self, va: VirtAddr) -> FrameId {
        let frames = &self.vm.frames;
        let fid = self.page(va).and_then(|page| page.frame());
        if let Some(fid) = fid.filter(|&fid| frames.frame(fid).is_locked_by_current_thread()) {
            return fid;
        }
        // 页表项可能已被同一进程的另一个线程删除，但帧还被当前线程钉着
        let vpn = va.vpn_floor();
        match frames.find_locked_by_current_thread(|page| {
            page.vpn() == vpn && page.belongs_to(&self.page_table)
        }) {
            Some(fid) => fid,
            None => panic!("page at {va:?} is not pinned by the current thread"),
        }
    }

    /// 以用户身份访问 `va`，`f` 拿到的是从 `va` 开始到页末尾的字节
    pub fn access<R>(
        &self,
        va: VirtAddr,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, PageFault> {
        let offset = va.page_offset();
        self.page_table.access(va, write, |fid| {
            self.vm.frames.with_data(fid, |data| f(&mut data[offset..]))
        })
    }

    /// 删除 `va` 所在页的页表项，驻留的内容直接丢弃
    pub fn deallocate(&self, va: VirtAddr) {
        let page = self.pages.lock().remove(&va.vpn_floor());
        if let Some(page) = page {
            self.destroy_page(&page);
        }
    }

    fn destroy_page(&self, page: &Page) {
        let frames = &self.vm.frames;
        // 此后没有线程能再为它链接帧
        page.kill();
        // 正被换入或换出时，等那个线程放开帧后再看 slot
        while page.frame().is_some() {
            if let Some(fid) = frames.lock_page_frame(page) {
                self.page_table.unmap(page.vpn());
                frames.free(fid);
                break;
            }
        }
        if let Some(slot) = page.take_swap_slot() {
            self.vm.swap.release(slot);
        }
    }

    /// 销毁整个地址空间，释放所有帧与 slot
    pub fn exit(&self) {
        let pages = core::mem::take(&mut *self.pages.lock());
        if pages.is_empty() {
            return;
        }
        debug!("tear down {} pages", pages.len());
        for page in pages.values() {
            self.destroy_page(page);
        }
    }

    /// 注册一段来自文件的程序段：前 `read_bytes` 字节来自 `file` 的 `offset` 处，之后 `zero_bytes` 字节为零
    ///
    /// 内容都在第一次访问时才读入
    pub fn map_segment(
        &self,
        file: StdArc<dyn BackingFile>,
        mut offset: usize,
        mut upage: VirtAddr,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> KResult<()> {
        if (read_bytes + zero_bytes) % PAGE_SIZE != 0
            || !upage.is_page_aligned()
            || offset % PAGE_SIZE != 0
        {
            return Err(errno::EINVAL);
        }
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;

            let page = self.allocate(upage, writable)?;
            if page_read_bytes > 0 {
                page.set_file_backing(file.clone(), offset, page_read_bytes);
            } else {
                page.set_zero_fill();
            }

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += page_read_bytes;
            upage = upage.add(PAGE_SIZE);
        }
        Ok(())
    }

    /// 在用户地址空间顶端建立第一个栈页并立即换入，返回初始栈指针
    pub fn setup_stack(&self) -> KResult<VirtAddr> {
        let top = VirtAddr(USER_TOP - PAGE_SIZE);
        let page = self.allocate(top, true)?;
        page.set_zero_fill();
        let fid = self.pin(&page)?;
        self.vm.frames.unlock(fid);
        Ok(VirtAddr(USER_TOP))
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// 驻留的页数
    pub fn resident_count(&self) -> usize {
        self.pages
            .lock()
            .values()
            .filter(|page| page.location() == PageLocation::InFrame)
            .count()
    }
}

impl Drop for MemorySpace {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests;
