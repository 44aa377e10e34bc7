//! 交换区
//!
//! 交换设备按页大小切分为若干 slot，slot `i` 占据扇区 `i * PAGE_SECTORS` 起的连续 `PAGE_SECTORS` 个扇区。
//! 空闲情况记录在一个位图中，由一把自旋锁保护；设备读写在锁外进行。

use std::sync::Arc;

use defines::{
    config::{PAGE_SECTORS, PAGE_SIZE, SECTOR_SIZE},
    error::{errno, KResult},
};
use drivers::{BlockDevice, Sector};
use idallocator::BitmapAllocator;
use klocks::SpinMutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> usize {
        self.0 * PAGE_SECTORS
    }
}

pub struct Swap {
    device: Option<Arc<dyn BlockDevice>>,
    slots: SpinMutex<BitmapAllocator>,
}

impl Swap {
    /// 没有交换设备时 slot 数为 0，任何换出都会失败
    pub fn new(device: Option<Arc<dyn BlockDevice>>) -> Self {
        let capacity = device
            .as_ref()
            .map_or(0, |device| device.sector_count() / PAGE_SECTORS);
        if device.is_some() {
            info!("swap: {capacity} slots");
        } else {
            info!("swap: no device, swapping disabled");
        }
        Self {
            device,
            slots: SpinMutex::new(BitmapAllocator::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity()
    }

    /// 正在使用的 slot 数
    pub fn used(&self) -> usize {
        self.slots.lock().used()
    }

    /// 申请一个空闲 slot，但不写入内容
    pub fn alloc_slot(&self) -> KResult<SwapSlot> {
        match self.slots.lock().scan_and_flip() {
            Some(idx) => Ok(SwapSlot(idx)),
            None => {
                warn!("swap: out of slots");
                Err(errno::ENOSPC)
            }
        }
    }

    /// 将一页内容写入已申请的 slot
    pub fn write_slot(&self, slot: SwapSlot, data: &[u8; PAGE_SIZE]) {
        debug_assert!(self.slots.lock().test(slot.index()));
        let device = self.device();
        let mut sector: Sector = [0; SECTOR_SIZE];
        for (i, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
            sector.copy_from_slice(chunk);
            device.write_sector(slot.first_sector() + i, &sector);
        }
        trace!("swap: page written to slot {}", slot.index());
    }

    /// 申请 slot 并写入一页内容
    pub fn swap_out(&self, data: &[u8; PAGE_SIZE]) -> KResult<SwapSlot> {
        let slot = self.alloc_slot()?;
        self.write_slot(slot, data);
        Ok(slot)
    }

    /// 读回 slot 中的内容，读完之后释放 slot
    pub fn swap_in(&self, slot: SwapSlot, data: &mut [u8; PAGE_SIZE]) {
        let device = self.device();
        let mut sector: Sector = [0; SECTOR_SIZE];
        for (i, chunk) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            device.read_sector(slot.first_sector() + i, &mut sector);
            chunk.copy_from_slice(&sector);
        }
        self.release(slot);
        trace!("swap: page read back from slot {}", slot.index());
    }

    /// 直接丢弃 slot 中的内容
    pub fn release(&self, slot: SwapSlot) {
        self.slots.lock().reset(slot.index());
    }

    fn device(&self) -> &dyn BlockDevice {
        // 容量为 0 时不可能分配出 slot
        self.device
            .as_deref()
            .expect("swap slot in use without a swap device")
    }
}
