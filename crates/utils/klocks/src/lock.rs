//! 带优先级捐赠的睡眠锁
//!
//! 锁本身是一个初值为 1 的信号量，持有者、等待者等关系记录在 [`crate::donation`] 中

use crate::{
    donation::{LockId, DONATION},
    thread, Semaphore,
};

pub struct Lock {
    id: LockId,
    sema: Semaphore,
}

impl Lock {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            id: DONATION.lock().register_lock(),
            sema: Semaphore::new(1),
        }
    }

    /// 获取锁，必要时睡眠等待
    ///
    /// 等待期间当前线程的优先级会捐赠给持有者，并沿着持有者所等待的锁继续向上传递
    ///
    /// # Panics
    ///
    /// 当前线程已经持有该锁
    #[track_caller]
    pub fn acquire(&self) {
        assert!(
            !self.held_by_current_thread(),
            "lock acquired recursively by thread {}",
            thread::current_tid()
        );
        let cur = thread::current();
        if !self.sema.try_down() {
            DONATION.lock().block_on(self.id, &cur);
            self.sema.down();
        }
        DONATION.lock().acquired(self.id, &cur);
    }

    /// 不阻塞地尝试获取锁，不进行任何捐赠
    #[track_caller]
    pub fn try_acquire(&self) -> bool {
        assert!(
            !self.held_by_current_thread(),
            "lock acquired recursively by thread {}",
            thread::current_tid()
        );
        if !self.sema.try_down() {
            return false;
        }
        DONATION.lock().acquired(self.id, &thread::current());
        true
    }

    /// 释放锁
    ///
    /// 重新计算优先级与唤醒等待者在同一个临界区内完成
    ///
    /// # Panics
    ///
    /// 当前线程不持有该锁
    #[track_caller]
    pub fn release(&self) {
        let cur = thread::current();
        {
            let mut donation = DONATION.lock();
            donation.released(self.id, &cur);
            self.sema.up();
        }
        // 被唤醒的线程可能优先级更高
        thread::yield_now();
    }

    pub fn held_by_current_thread(&self) -> bool {
        DONATION.lock().holder(self.id) == Some(thread::current_tid())
    }

    /// 锁是否被某个线程持有。仅供参考，返回时结果可能已经过时
    pub fn is_locked(&self) -> bool {
        DONATION.lock().holder(self.id).is_some()
    }

    /// 获取锁并返回 RAII 守卫
    pub fn lock(&self) -> LockGuard<'_> {
        self.acquire();
        LockGuard { lock: self }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        DONATION.lock().unregister_lock(self.id);
    }
}

#[must_use = "if unused the Lock will immediately unlock"]
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
