//! 虚拟内存：帧表、交换区、补充页表，以及把它们粘在一起的缺页与钉页协议

#[macro_use]
extern crate log;

mod address;
mod file;
mod frame;
mod memory_space;
mod page;
mod page_table;
mod swap;

use std::sync::Arc as StdArc;

use defines::config::USER_FRAME_NUM;
use drivers::BlockDevice;
use triomphe::Arc;

pub use self::address::{VirtAddr, VirtPageNum};
pub use self::file::{BackingFile, MemFile};
pub use self::frame::{Clock, EvictPolicy, Frame, FrameId, FrameTable, RandomEvict};
pub use self::memory_space::MemorySpace;
pub use self::page::{FileBacking, Page, PageLocation};
pub use self::page_table::{PTEFlags, PageFault, PageTable, PageTableEntry};
pub use self::swap::{Swap, SwapSlot};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EvictPolicyKind {
    #[default]
    Clock,
    Random,
}

/// 虚拟内存子系统的启动参数
#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    pub frame_count: usize,
    pub policy: EvictPolicyKind,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frame_count: USER_FRAME_NUM,
            policy: EvictPolicyKind::default(),
        }
    }
}

/// 全系统共享的帧表与交换区
pub struct Vm {
    pub frames: FrameTable,
    pub swap: Swap,
}

impl Vm {
    pub fn new(config: VmConfig, swap_device: Option<StdArc<dyn BlockDevice>>) -> Arc<Self> {
        let policy: Box<dyn EvictPolicy> = match config.policy {
            EvictPolicyKind::Clock => Box::new(Clock::new()),
            EvictPolicyKind::Random => Box::new(RandomEvict::new()),
        };
        Arc::new(Self {
            frames: FrameTable::new(config.frame_count, policy),
            swap: Swap::new(swap_device),
        })
    }
}
