mod block;

pub use self::block::{ram_disk::RamDisk, BlockDevice, Sector};
