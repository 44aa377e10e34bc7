use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use klocks::{Lazy, Lock};
use memory::{BackingFile, VirtAddr};
use scopeguard::defer;

use crate::process::Process;

/// 文件系统本身不是线程安全的，所有文件操作都要先持有这把锁
pub static FILESYS_LOCK: Lazy<Lock> = Lazy::new(Lock::new);

/// 从 `file` 的 `offset` 处读取至多 `size` 字节，直接写入用户缓冲区 `ubuf`
///
/// 每一页目标缓冲区在读入期间都被钉住。返回实际读到的字节数，读到文件末尾时会少于 `size`。
/// 缓冲区不可写或无效时返回 `EFAULT`
pub fn read_file_to_user(
    process: &Process,
    file: &dyn BackingFile,
    mut offset: usize,
    mut ubuf: VirtAddr,
    mut size: usize,
    esp: Option<VirtAddr>,
) -> KResult<usize> {
    let space = process.memory_space();
    let _guard = FILESYS_LOCK.lock();
    let mut total = 0;
    while size > 0 {
        let page_offset = ubuf.page_offset();
        let chunk = size.min(PAGE_SIZE - page_offset);
        space
            .page_lock(ubuf, true, esp)
            .map_err(|err| match err {
                errno::ENOMEM | errno::ENOSPC => err,
                _ => errno::EFAULT,
            })?;
        let read = {
            defer! {
                space.page_unlock(ubuf);
            }
            space.with_pinned(ubuf, true, |data| {
                file.read_at(&mut data[page_offset..page_offset + chunk], offset)
            })
        };
        total += read;
        if read < chunk {
            break;
        }
        offset += chunk;
        ubuf = ubuf.add(chunk);
        size -= chunk;
    }
    trace!("{}: read {total} bytes from file", process.name());
    Ok(total)
}
