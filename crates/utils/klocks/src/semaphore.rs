use core::cmp::Reverse;
use std::collections::VecDeque;

use triomphe::Arc;

use crate::{
    thread::{self, KThread},
    SpinMutex,
};

/// 计数信号量
///
/// `up` 唤醒有效优先级最高的等待者，同优先级之间先来先服务
pub struct Semaphore {
    inner: SpinMutex<SemaphoreInner>,
}

struct SemaphoreInner {
    value: usize,
    waiters: VecDeque<Arc<KThread>>,
}

impl Semaphore {
    pub const fn new(value: usize) -> Self {
        Self {
            inner: SpinMutex::new(SemaphoreInner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// P 操作。值为 0 时阻塞当前线程
    ///
    /// 不可在中断上下文中调用
    #[track_caller]
    pub fn down(&self) {
        assert!(
            !thread::in_intr_context(),
            "Semaphore::down in interrupt context"
        );
        let cur = thread::current();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.value > 0 {
                    inner.value -= 1;
                    return;
                }
                inner.waiters.push_back(cur.clone());
            }
            // 被唤醒后值可能又被别人抢走了，因此要重新检查
            thread::block();
        }
    }

    /// 不阻塞的 P 操作，任何上下文都可调用
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// V 操作
    pub fn up(&self) {
        let waiter = {
            let mut inner = self.inner.lock();
            inner.value += 1;
            inner.pop_highest()
        };
        if let Some(waiter) = waiter {
            thread::unblock(&waiter);
        }
    }

    pub fn value(&self) -> usize {
        self.inner.lock().value
    }
}

impl SemaphoreInner {
    fn pop_highest(&mut self) -> Option<Arc<KThread>> {
        // `min_by_key` 在相等时返回最先出现的那个
        let (idx, _) = self
            .waiters
            .iter()
            .enumerate()
            .min_by_key(|(_, thread)| Reverse(thread.priority()))?;
        self.waiters.remove(idx)
    }
}
