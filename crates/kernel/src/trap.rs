use core::ops::ControlFlow;

use defines::{config::EXIT_ACCESS_VIOLATION, error::errno};
use memory::{PageFault, VirtAddr};

use crate::process::Process;

/// 一次缺页陷入时硬件与陷入帧提供的信息
#[derive(Clone, Copy, Debug)]
pub struct PageFaultInfo {
    pub addr: VirtAddr,
    /// 陷入时的用户栈指针，用于判断栈增长
    pub esp: Option<VirtAddr>,
    pub not_present: bool,
    pub write: bool,
}

impl PageFaultInfo {
    pub fn new(fault: PageFault, esp: Option<VirtAddr>) -> Self {
        Self {
            addr: fault.addr,
            esp,
            not_present: fault.not_present,
            write: fault.write,
        }
    }
}

/// 缺页处理。返回 `ControlFlow::Break` 时进程已被终止，其线程应当退出
pub fn page_fault_handler(process: &Process, info: PageFaultInfo) -> ControlFlow<()> {
    let space = process.memory_space();
    let result = if !info.not_present {
        // 页已映射，那就是写了只读页
        Err(errno::EACCES)
    } else if info.write && space.page(info.addr).is_some_and(|page| !page.is_writable()) {
        Err(errno::EACCES)
    } else {
        space.page_in(info.addr, info.esp)
    };

    match result {
        Ok(()) => ControlFlow::Continue(()),
        Err(err) => {
            debug!(
                "{}: unresolved {} fault at {:?}: {err}",
                process.name(),
                if info.write { "write" } else { "read" },
                info.addr,
            );
            process.exit(EXIT_ACCESS_VIOLATION);
            ControlFlow::Break(())
        }
    }
}
