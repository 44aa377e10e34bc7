//! 内核线程层
//!
//! 每个内核线程由一个宿主线程承载，这里只维护调度器需要提供给同步原语的那部分：
//! 当前线程、阻塞与唤醒、让出、基础优先级与有效优先级

use core::{
    cell::{Cell, RefCell},
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};
use std::{io, thread::JoinHandle};

use compact_str::CompactString;
use event_listener::{listener, Event, Listener};
use idallocator::RecycleAllocator;
use triomphe::Arc;

use crate::{donation, SpinMutex};

pub type Tid = usize;

pub const PRI_MIN: u8 = 0;
pub const PRI_DEFAULT: u8 = 31;
pub const PRI_MAX: u8 = 63;

static TID_ALLOCATOR: SpinMutex<RecycleAllocator> = SpinMutex::new(RecycleAllocator::begin_with(1));

std::thread_local! {
    static CURRENT: RefCell<Option<Arc<KThread>>> = const { RefCell::new(None) };
    static INTR_DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub struct KThread {
    tid: Tid,
    name: CompactString,
    /// 不考虑捐赠时的优先级
    base_priority: AtomicU8,
    /// 有效优先级，仅在持有捐赠表的锁时修改
    priority: AtomicU8,
    wakeup: AtomicBool,
    wakeup_event: Event,
}

impl KThread {
    fn new(name: &str, priority: u8) -> Arc<Self> {
        assert!(priority <= PRI_MAX, "priority {priority} out of range");
        Arc::new(Self {
            tid: TID_ALLOCATOR.lock().alloc(),
            name: name.into(),
            base_priority: AtomicU8::new(priority),
            priority: AtomicU8::new(priority),
            wakeup: AtomicBool::new(false),
            wakeup_event: Event::new(),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 有效优先级
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_effective_priority(&self, priority: u8) -> bool {
        self.priority.swap(priority, Ordering::AcqRel) != priority
    }

    pub(crate) fn set_base_priority(&self, priority: u8) {
        self.base_priority.store(priority, Ordering::Release);
    }
}

impl Drop for KThread {
    fn drop(&mut self) {
        TID_ALLOCATOR.lock().dealloc(self.tid);
    }
}

impl core::fmt::Debug for KThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KThread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("priority", &self.priority())
            .finish()
    }
}

/// 当前线程。未经 [`spawn`] 创建的宿主线程在第一次调用时以默认优先级登记
pub fn current() -> Arc<KThread> {
    CURRENT.with(|current| {
        current
            .borrow_mut()
            .get_or_insert_with(|| {
                let host = std::thread::current();
                KThread::new(host.name().unwrap_or("main"), PRI_DEFAULT)
            })
            .clone()
    })
}

pub fn current_tid() -> Tid {
    current().tid()
}

/// 以给定名字和优先级创建内核线程
pub fn spawn<F, T>(name: &str, priority: u8, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let thread = KThread::new(name, priority);
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            CURRENT.with(|current| *current.borrow_mut() = Some(thread));
            f()
        })
}

/// 阻塞当前线程直到有人对它调用 [`unblock`]
///
/// 唤醒先于阻塞到达时不会丢失
pub fn block() {
    assert!(!in_intr_context(), "cannot block inside interrupt context");
    let cur = current();
    loop {
        if cur.wakeup.swap(false, Ordering::AcqRel) {
            return;
        }
        listener!(cur.wakeup_event => listener);
        // 建立监听之前可能已经被唤醒了
        if cur.wakeup.swap(false, Ordering::AcqRel) {
            return;
        }
        listener.wait();
    }
}

pub fn unblock(thread: &KThread) {
    thread.wakeup.store(true, Ordering::Release);
    thread.wakeup_event.notify(1);
}

pub fn yield_now() {
    std::thread::yield_now();
}

/// 设置当前线程的基础优先级，有效优先级随之重新计算
///
/// 被捐赠的优先级不会因此丢失
pub fn set_priority(priority: u8) {
    assert!(priority <= PRI_MAX, "priority {priority} out of range");
    let cur = current();
    donation::set_base_priority(&cur, priority);
    yield_now();
}

pub fn get_priority() -> u8 {
    current().priority()
}

/// 标记当前上下文不可阻塞，模拟中断处理程序
///
/// 存活期间调用 [`block`]（以及 `Semaphore::down` 等）会 panic
pub struct IntrContext {
    // 与线程绑定，不允许跨线程转移
    _not_send: PhantomData<*const ()>,
}

impl IntrContext {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        INTR_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for IntrContext {
    fn drop(&mut self) {
        INTR_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

pub fn in_intr_context() -> bool {
    INTR_DEPTH.with(Cell::get) > 0
}
