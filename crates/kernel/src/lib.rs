//! 进程层：把虚拟内存子系统接到进程、缺页陷入与用户内存访问上

#[macro_use]
extern crate log;

pub mod fs;
pub mod process;
pub mod trap;
pub mod user_ptr;

use std::sync::Arc as StdArc;

use defines::config::PAGE_SECTORS;
use drivers::{BlockDevice, RamDisk};
use klocks::Once;
use memory::{Vm, VmConfig};
use triomphe::Arc;

pub use self::{
    process::{Process, ProcessStatus},
    trap::{page_fault_handler, PageFaultInfo},
};

static VM: Once<Arc<Vm>> = Once::new();

/// 初始化日志与全局的虚拟内存子系统
///
/// 只有第一次调用生效，之后的调用直接返回已有的 [`Vm`]
pub fn init(config: VmConfig, swap_device: Option<StdArc<dyn BlockDevice>>) -> &'static Arc<Vm> {
    simple_logger::init();
    VM.call_once(|| {
        let vm = Vm::new(config, swap_device);
        info!(
            "vm initialized: {} frames, {} swap slots, {:?} eviction",
            vm.frames.len(),
            vm.swap.capacity(),
            config.policy,
        );
        vm
    })
}

/// 全局的虚拟内存子系统，必须先调用 [`init`]
pub fn vm() -> &'static Arc<Vm> {
    VM.get().expect("vm used before kernel::init")
}

/// 一块能容纳 `slots` 个页的内存盘，用作交换设备
pub fn ram_swap(slots: usize) -> StdArc<dyn BlockDevice> {
    StdArc::new(RamDisk::new(slots * PAGE_SECTORS))
}
