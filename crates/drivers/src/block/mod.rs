pub mod ram_disk;

use defines::config::SECTOR_SIZE;

pub type Sector = [u8; SECTOR_SIZE];

/// 块设备的抽象，读写都以扇区为单位同步进行
///
/// 设备总是会完成请求，不考虑损坏与超时
pub trait BlockDevice: Send + Sync {
    /// 设备的扇区总数
    fn sector_count(&self) -> usize;
    fn read_sector(&self, sector_id: usize, buf: &mut Sector);
    fn write_sector(&self, sector_id: usize, buf: &Sector);
}
