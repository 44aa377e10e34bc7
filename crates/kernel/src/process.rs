use atomic::{Atomic, Ordering};
use compact_str::CompactString;
use defines::error::{errno, KResult};
use idallocator::RecycleAllocator;
use klocks::SpinMutex;
use memory::{MemorySpace, VirtAddr, Vm};
use triomphe::Arc;

use crate::trap::{self, PageFaultInfo};

static PID_ALLOCATOR: SpinMutex<RecycleAllocator> =
    SpinMutex::new(RecycleAllocator::begin_with(1));

pub struct Process {
    pid: usize,
    name: CompactString,
    pub status: Atomic<ProcessStatus>,
    memory_space: MemorySpace,
}

impl Process {
    /// 在全局的 [`Vm`] 上创建一个地址空间为空的进程
    pub fn new(name: impl Into<CompactString>) -> Arc<Self> {
        Self::with_vm(name, Arc::clone(crate::vm()))
    }

    pub fn with_vm(name: impl Into<CompactString>, vm: Arc<Vm>) -> Arc<Self> {
        let process = Arc::new(Self {
            pid: PID_ALLOCATOR.lock().alloc(),
            name: name.into(),
            status: Atomic::new(ProcessStatus::normal()),
            memory_space: MemorySpace::new(vm),
        });
        debug!("process {} ({}) created", process.pid, process.name);
        process
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory_space(&self) -> &MemorySpace {
        &self.memory_space
    }

    pub fn exit_code(&self) -> Option<i8> {
        self.status.load(Ordering::SeqCst).exit_code()
    }

    /// 以 `exit_code` 退出，并销毁整个地址空间
    ///
    /// 只有第一次调用生效
    pub fn exit(&self, exit_code: i8) {
        if self
            .status
            .compare_exchange(
                ProcessStatus::normal(),
                ProcessStatus::exited(exit_code),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        info!("{}: exit({exit_code})", self.name);
        self.memory_space.exit();
    }

    /// 以用户身份从 `va` 读取 `buf.len()` 字节，经由 MMU，缺页时陷入
    ///
    /// 缺页无法解决时进程被终止，返回 `EFAULT`
    pub fn read_user(&self, va: VirtAddr, buf: &mut [u8], esp: Option<VirtAddr>) -> KResult<()> {
        self.user_access(va, buf.len(), false, esp, |done, bytes| {
            let n = bytes.len().min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&bytes[..n]);
            n
        })
    }

    /// 以用户身份把 `data` 写到 `va`
    pub fn write_user(&self, va: VirtAddr, data: &[u8], esp: Option<VirtAddr>) -> KResult<()> {
        self.user_access(va, data.len(), true, esp, |done, bytes| {
            let n = bytes.len().min(data.len() - done);
            bytes[..n].copy_from_slice(&data[done..done + n]);
            n
        })
    }

    /// `f` 拿到已完成的字节数与当前页剩下的部分，返回这次处理的字节数
    fn user_access(
        &self,
        va: VirtAddr,
        len: usize,
        write: bool,
        esp: Option<VirtAddr>,
        mut f: impl FnMut(usize, &mut [u8]) -> usize,
    ) -> KResult<()> {
        let mut done = 0;
        while done < len {
            let curr = va.add(done);
            match self
                .memory_space
                .access(curr, write, |bytes| f(done, bytes))
            {
                Ok(n) => done += n,
                Err(fault) => {
                    let info = PageFaultInfo::new(fault, esp);
                    if trap::page_fault_handler(self, info).is_break() {
                        return Err(errno::EFAULT);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        PID_ALLOCATOR.lock().dealloc(self.pid);
    }
}

/// 标记一个进程的状态，其中低 8 位记录 exit code
///
/// 高 8 位的可能有如下几种：
/// - 0: 进程处于正常状态下
/// - 1: 进程已退出，地址空间已销毁
#[derive(bytemuck::NoUninit, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ProcessStatus(u16);

impl ProcessStatus {
    pub fn normal() -> Self {
        Self(0)
    }

    pub fn exited(exit_code: i8) -> Self {
        Self((1 << 8) | (exit_code as u8 as u16))
    }

    pub fn exit_code(self) -> Option<i8> {
        (self.0 >> 8 == 1).then_some(self.0 as u8 as i8)
    }
}
