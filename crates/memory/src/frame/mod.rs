//! 用户页帧表
//!
//! 启动时一次性建立固定数量的帧，此后不再增减。
//! 每个帧有一把睡眠锁，只有持有它的线程可以修改帧的内容以及帧与页之间的链接；
//! 另有一把扫描锁，只保护“寻找一个可用的帧”这一过程。

mod evict;

use defines::{
    config::{EVICT_RETRY_LIMIT, PAGE_SIZE},
    error::{errno, KResult},
};
use klocks::{thread, Lock, SpinMutex};
use triomphe::Arc;

pub use self::evict::{Clock, EvictPolicy, RandomEvict};
use crate::{page::Page, swap::Swap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub usize);

pub struct Frame {
    lock: Lock,
    /// 驻留在该帧中的页
    page: SpinMutex<Option<Arc<Page>>>,
    /// 这两把自旋锁都只在拷贝或改链接的一瞬间持有
    data: SpinMutex<Box<[u8; PAGE_SIZE]>>,
}

impl Frame {
    fn new() -> Self {
        Self {
            lock: Lock::new(),
            page: SpinMutex::new(None),
            data: SpinMutex::new(Box::new([0; PAGE_SIZE])),
        }
    }

    /// 不阻塞地锁住该帧。当前线程已经持有它时同样返回 `false`
    pub fn try_lock(&self) -> bool {
        !self.lock.held_by_current_thread() && self.lock.try_acquire()
    }

    pub fn unlock(&self) {
        self.lock.release();
    }

    pub fn is_locked_by_current_thread(&self) -> bool {
        self.lock.held_by_current_thread()
    }

    /// 驻留在该帧中的页
    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.lock().clone()
    }

    fn is_free(&self) -> bool {
        self.page.lock().is_none()
    }
}

pub struct FrameTable {
    frames: Box<[Frame]>,
    scan_lock: Lock,
    policy: SpinMutex<Box<dyn EvictPolicy>>,
}

impl FrameTable {
    pub fn new(count: usize, policy: Box<dyn EvictPolicy>) -> Self {
        info!("frame table: {count} user frames");
        Self {
            frames: (0..count).map(|_| Frame::new()).collect(),
            scan_lock: Lock::new(),
            policy: SpinMutex::new(policy),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, fid: FrameId) -> &Frame {
        &self.frames[fid.0]
    }

    /// 为 `page` 分配一个帧，返回时该帧已与 `page` 相互链接，并由当前线程持有
    ///
    /// 没有空闲帧时换出一个牺牲页。所有帧都被钉住时有限次重试，之后返回 `ENOMEM`；
    /// 若每次换出都因交换区已满而失败则返回 `ENOSPC`。
    /// `page` 已经有帧（另一线程抢先换入了它）时返回 `EBUSY`，调用者应转而锁住已有的帧；
    /// `page` 已被删除时返回 `EFAULT`。
    pub fn alloc_and_lock(&self, page: &Arc<Page>, swap: &Swap) -> KResult<FrameId> {
        let mut last_err = errno::ENOMEM;
        for _ in 0..EVICT_RETRY_LIMIT {
            if page.is_dead() {
                return Err(errno::EFAULT);
            }
            if page.frame().is_some() {
                return Err(errno::EBUSY);
            }
            let candidate = {
                let _scan = self.scan_lock.lock();
                self.find_free()
                    .or_else(|| self.policy.lock().pick_victim(&self.frames))
            };
            let Some(fid) = candidate else {
                thread::yield_now();
                continue;
            };

            // 此时已持有 `fid` 的锁
            if let Some(victim) = self.frame(fid).page() {
                trace!("evict page {:?} from frame {}", victim.vpn(), fid.0);
                if let Err(err) = victim.page_out(self, fid, swap) {
                    self.unlock(fid);
                    last_err = err;
                    continue;
                }
            }
            return self.link(fid, page).map(|()| fid);
        }
        warn!("frame table: no frame for page {:?}: {last_err}", page.vpn());
        Err(last_err)
    }

    /// 在扫描锁内调用
    fn find_free(&self) -> Option<FrameId> {
        self.frames.iter().enumerate().find_map(|(idx, frame)| {
            if !frame.try_lock() {
                return None;
            }
            if frame.is_free() {
                Some(FrameId(idx))
            } else {
                frame.unlock();
                None
            }
        })
    }

    fn link(&self, fid: FrameId, page: &Arc<Page>) -> KResult<()> {
        if let Err(err) = page.attach_frame(fid) {
            self.unlock(fid);
            return Err(err);
        }
        *self.frame(fid).page.lock() = Some(page.clone());
        Ok(())
    }

    /// 锁住 `page` 所在的帧
    ///
    /// 加锁之后再检查一次：等锁期间该帧可能已被换出并分给了别的页，此时放弃并返回 `None`
    pub fn lock_page_frame(&self, page: &Page) -> Option<FrameId> {
        let fid = page.frame()?;
        let frame = self.frame(fid);
        frame.lock.acquire();
        if page.frame() == Some(fid) {
            Some(fid)
        } else {
            frame.unlock();
            None
        }
    }

    /// 解锁帧，保留映射。之后它就可以被换出了
    pub fn unlock(&self, fid: FrameId) {
        self.frame(fid).unlock();
    }

    /// 解除帧与页之间的链接并解锁帧，帧中内容作废
    pub fn free(&self, fid: FrameId) {
        let frame = self.frame(fid);
        debug_assert!(frame.is_locked_by_current_thread());
        let page = frame.page.lock().take();
        if let Some(page) = page {
            page.detach_frame(fid);
        }
        frame.unlock();
    }

    /// 只清除帧到页的链接，由换出流程调用
    pub(crate) fn clear_page(&self, fid: FrameId) {
        let frame = self.frame(fid);
        debug_assert!(frame.is_locked_by_current_thread());
        *frame.page.lock() = None;
    }

    /// 访问帧中的数据。调用者应当持有帧的锁，或者持有映射着它的页表
    ///
    /// `f` 在自旋锁内运行，只能做内存拷贝这样的短操作
    pub fn with_data<R>(&self, fid: FrameId, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        f(&mut self.frame(fid).data.lock())
    }

    /// 当前线程持有的、驻留着满足 `pred` 的页的帧
    pub(crate) fn find_locked_by_current_thread(
        &self,
        pred: impl Fn(&Page) -> bool,
    ) -> Option<FrameId> {
        self.frames.iter().enumerate().find_map(|(idx, frame)| {
            (frame.is_locked_by_current_thread() && frame.page().is_some_and(|page| pred(&page)))
                .then_some(FrameId(idx))
        })
    }

    /// 被占用的帧数
    pub fn used_count(&self) -> usize {
        self.frames.iter().filter(|frame| !frame.is_free()).count()
    }

    /// 检查帧与页之间的链接是否一致。被其他线程持有的帧不检查
    pub fn check_links(&self) -> bool {
        self.frames.iter().enumerate().all(|(idx, frame)| {
            if !frame.try_lock() {
                return true;
            }
            let consistent = frame
                .page()
                .map_or(true, |page| page.frame() == Some(FrameId(idx)));
            frame.unlock();
            consistent
        })
    }
}
