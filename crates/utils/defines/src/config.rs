const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 块设备扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一页对应的扇区数，也就是一个 swap slot 占用的扇区数
pub const PAGE_SECTORS: usize = PAGE_SIZE / SECTOR_SIZE;

/// 用户地址空间的末端（不含），在此之上是内核地址
pub const USER_TOP: usize = 0xC000_0000;

/// 用户栈最多能增长到的大小
pub const STACK_MAX: usize = MB;
/// 栈指针之下仍然视为合法栈访问的距离
///
/// 一次压栈最多可能在栈指针之下 32 字节处触发缺页
pub const STACK_SLACK: usize = 32;

/// 默认可供用户使用的物理页帧数量
pub const USER_FRAME_NUM: usize = 256;

/// 分配物理页帧时，找不到可换出的帧的最大重试次数
pub const EVICT_RETRY_LIMIT: usize = 64;

/// 优先级捐赠时沿着等待链最多走的深度
pub const DONATION_DEPTH_MAX: usize = 8;

/// 因非法访存被终止的进程的退出码
pub const EXIT_ACCESS_VIOLATION: i8 = -1;
