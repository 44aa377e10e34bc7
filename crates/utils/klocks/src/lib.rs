//! 内核同步原语
//!
//! 内核线程由宿主线程承载，阻塞与唤醒基于 `event_listener`。
//! 在此之上实现信号量、带优先级捐赠的锁与条件变量。

#[macro_use]
extern crate log;

mod condvar;
mod donation;
mod kspin;
mod lock;
mod semaphore;
pub mod thread;

pub use condvar::Condvar;
pub use kspin::{SpinMutex, SpinMutexGuard};
pub use lock::{Lock, LockGuard};
pub use semaphore::Semaphore;
pub use spin::{Lazy, Once};
