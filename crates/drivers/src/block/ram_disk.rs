use core::sync::atomic::{AtomicUsize, Ordering};

use defines::config::SECTOR_SIZE;
use klocks::SpinMutex;

use super::{BlockDevice, Sector};

/// 内存模拟的块设备
pub struct RamDisk {
    sectors: SpinMutex<Vec<Sector>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: SpinMutex::new(vec![[0; SECTOR_SIZE]; sector_count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 已完成的读扇区次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已完成的写扇区次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().len()
    }

    fn read_sector(&self, sector_id: usize, buf: &mut Sector) {
        let sectors = self.sectors.lock();
        assert!(sector_id < sectors.len(), "sector {sector_id} out of range");
        buf.copy_from_slice(&sectors[sector_id]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector_id: usize, buf: &Sector) {
        let mut sectors = self.sectors.lock();
        assert!(sector_id < sectors.len(), "sector {sector_id} out of range");
        sectors[sector_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}
