//! 优先级捐赠的簿记
//!
//! 锁与线程之间的关系（持有者、等待者、被哪把锁阻塞、持有哪些锁）统一放在一张表里，
//! 以 `LockId` 和 `Tid` 相互引用，由一把自旋锁保护。
//! 线程的有效优先级只在持有这把锁时修改。

use defines::config::DONATION_DEPTH_MAX;
use hashbrown::HashMap;
use slab::Slab;
use smallvec::SmallVec;
use triomphe::Arc;

use crate::{
    thread::{KThread, Tid, PRI_MIN},
    Lazy, SpinMutex,
};

pub(crate) type LockId = usize;

pub(crate) static DONATION: Lazy<SpinMutex<Donation>> = Lazy::new(|| {
    SpinMutex::new(Donation {
        locks: Slab::new(),
        threads: HashMap::new(),
    })
});

pub(crate) struct Donation {
    locks: Slab<LockLinks>,
    threads: HashMap<Tid, ThreadLinks>,
}

struct LockLinks {
    holder: Option<Arc<KThread>>,
    /// 等待者中最高的有效优先级，无等待者时为 `PRI_MIN`
    ceiling: u8,
    waiters: SmallVec<[Arc<KThread>; 4]>,
}

#[derive(Default)]
struct ThreadLinks {
    blocked_by: Option<LockId>,
    held: SmallVec<[LockId; 4]>,
}

impl Donation {
    pub fn register_lock(&mut self) -> LockId {
        self.locks.insert(LockLinks {
            holder: None,
            ceiling: PRI_MIN,
            waiters: SmallVec::new(),
        })
    }

    /// 锁被销毁。若仍被持有，则从持有者的持有集合中摘除
    pub fn unregister_lock(&mut self, lock: LockId) {
        let links = self.locks.remove(lock);
        debug_assert!(links.waiters.is_empty());
        if let Some(holder) = links.holder {
            self.forget_held(&holder, lock);
            self.refresh(&holder);
        }
    }

    pub fn holder(&self, lock: LockId) -> Option<Tid> {
        self.locks[lock].holder.as_ref().map(|holder| holder.tid())
    }

    /// `thread` 即将阻塞在 `lock` 上：登记等待关系，并沿“被阻塞于 → 持有者”链条捐赠优先级
    pub fn block_on(&mut self, lock: LockId, thread: &Arc<KThread>) {
        let links = self.threads.entry(thread.tid()).or_default();
        debug_assert!(links.blocked_by.is_none());
        links.blocked_by = Some(lock);
        self.locks[lock].waiters.push(thread.clone());
        self.donate_from(lock);
    }

    /// `thread` 拿到了 `lock`（无论是否曾阻塞过）
    pub fn acquired(&mut self, lock: LockId, thread: &Arc<KThread>) {
        let tid = thread.tid();
        let links = &mut self.locks[lock];
        debug_assert!(links.holder.is_none());
        links.waiters.retain(|waiter| waiter.tid() != tid);
        links.holder = Some(thread.clone());
        links.ceiling = max_priority(&links.waiters);

        let thread_links = self.threads.entry(tid).or_default();
        thread_links.blocked_by = None;
        thread_links.held.push(lock);
        // 在持有者登记之前就排上队的等待者，此时才把优先级捐赠过来
        self.refresh(thread);
    }

    /// `thread` 释放了 `lock`，重新计算它的有效优先级
    pub fn released(&mut self, lock: LockId, thread: &Arc<KThread>) {
        let links = &mut self.locks[lock];
        assert!(
            links
                .holder
                .as_ref()
                .is_some_and(|holder| holder.tid() == thread.tid()),
            "lock released by thread {} which does not hold it",
            thread.tid()
        );
        links.holder = None;
        self.forget_held(thread, lock);
        self.refresh(thread);
    }

    fn forget_held(&mut self, thread: &KThread, lock: LockId) {
        let tid = thread.tid();
        if let Some(links) = self.threads.get_mut(&tid) {
            links.held.retain(|id| *id != lock);
            if links.held.is_empty() && links.blocked_by.is_none() {
                self.threads.remove(&tid);
            }
        }
    }

    /// 从 `lock` 开始沿链条向上调整天花板与持有者的优先级
    ///
    /// 某个持有者的有效优先级没有变化时停止；链条长度受 `DONATION_DEPTH_MAX` 限制，
    /// 且每把锁至多访问一次
    fn donate_from(&mut self, mut lock: LockId) {
        let mut visited = SmallVec::<[LockId; DONATION_DEPTH_MAX]>::new();
        while visited.len() < DONATION_DEPTH_MAX && !visited.contains(&lock) {
            visited.push(lock);
            let links = &mut self.locks[lock];
            links.ceiling = max_priority(&links.waiters);
            let Some(holder) = links.holder.clone() else {
                break;
            };
            if !self.refresh(&holder) {
                break;
            }
            trace!(
                "thread {} now runs at priority {}",
                holder.tid(),
                holder.priority()
            );
            match self.threads.get(&holder.tid()).and_then(|t| t.blocked_by) {
                Some(next) => lock = next,
                None => break,
            }
        }
    }

    /// 有效优先级 = max(基础优先级, 所持有的各锁的天花板)。返回是否发生变化
    fn refresh(&self, thread: &KThread) -> bool {
        let donated = self
            .threads
            .get(&thread.tid())
            .and_then(|links| links.held.iter().map(|&id| self.locks[id].ceiling).max())
            .unwrap_or(PRI_MIN);
        thread.set_effective_priority(thread.base_priority().max(donated))
    }
}

fn max_priority(threads: &[Arc<KThread>]) -> u8 {
    threads
        .iter()
        .map(|thread| thread.priority())
        .max()
        .unwrap_or(PRI_MIN)
}

pub(crate) fn set_base_priority(thread: &Arc<KThread>, priority: u8) {
    let mut donation = DONATION.lock();
    thread.set_base_priority(priority);
    if donation.refresh(thread) {
        // 若线程正阻塞在某把锁上，变化要沿链条传下去
        if let Some(lock) = donation
            .threads
            .get(&thread.tid())
            .and_then(|links| links.blocked_by)
        {
            donation.donate_from(lock);
        }
    }
}
