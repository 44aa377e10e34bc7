use core::cmp::Reverse;
use std::collections::VecDeque;

use triomphe::Arc;

use crate::{
    thread::{self, KThread},
    Lock, Semaphore, SpinMutex,
};

/// Mesa 语义的条件变量
///
/// `wait` 返回时条件不一定成立，调用者需要在循环中重新检查
pub struct Condvar {
    waiters: SpinMutex<VecDeque<Waiter>>,
}

struct Waiter {
    thread: Arc<KThread>,
    sema: Arc<Semaphore>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: SpinMutex::new(VecDeque::new()),
        }
    }

    /// 原子地释放 `lock` 并等待被唤醒，返回前重新获取 `lock`
    #[track_caller]
    pub fn wait(&self, lock: &Lock) {
        assert!(
            lock.held_by_current_thread(),
            "Condvar::wait without holding the lock"
        );
        let sema = Arc::new(Semaphore::new(0));
        self.waiters.lock().push_back(Waiter {
            thread: thread::current(),
            sema: sema.clone(),
        });
        lock.release();
        sema.down();
        lock.acquire();
    }

    /// 唤醒有效优先级最高的一个等待者（同优先级先来先服务）
    #[track_caller]
    pub fn signal(&self, lock: &Lock) {
        assert!(
            lock.held_by_current_thread(),
            "Condvar::signal without holding the lock"
        );
        let waiter = {
            let mut waiters = self.waiters.lock();
            waiters
                .iter()
                .enumerate()
                .min_by_key(|(_, waiter)| Reverse(waiter.thread.priority()))
                .map(|(idx, _)| idx)
                .and_then(|idx| waiters.remove(idx))
        };
        if let Some(waiter) = waiter {
            waiter.sema.up();
        }
    }

    #[track_caller]
    pub fn broadcast(&self, lock: &Lock) {
        while !self.waiters.lock().is_empty() {
            self.signal(lock);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
