//! 系统调用中内核对用户内存的访问
//!
//! 每次只处理一页：先用 `page_lock` 钉住它，拷贝完再 `page_unlock`，
//! 拷贝过程中该页不会被换出，也就不会在内核中缺页

use bytemuck::Pod;
use compact_str::CompactString;
use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use memory::{MemorySpace, VirtAddr};
use scopeguard::defer;

/// 钉住 `va` 所在的页后，对从 `va` 开始的页内部分调用 `f`
fn with_user_page<R>(
    space: &MemorySpace,
    va: VirtAddr,
    write: bool,
    f: impl FnOnce(&mut [u8]) -> R,
) -> KResult<R> {
    space.page_lock(va, write, None).map_err(|err| match err {
        errno::ENOMEM | errno::ENOSPC => err,
        _ => errno::EFAULT,
    })?;
    defer! {
        space.page_unlock(va);
    }
    let offset = va.page_offset();
    Ok(space.with_pinned(va, write, |data| f(&mut data[offset..])))
}

/// 从用户地址 `src` 拷贝 `dst.len()` 字节
pub fn copy_in(space: &MemorySpace, src: VirtAddr, dst: &mut [u8]) -> KResult<()> {
    let mut done = 0;
    while done < dst.len() {
        let rest = &mut dst[done..];
        done += with_user_page(space, src.add(done), false, |bytes| {
            let n = bytes.len().min(rest.len());
            rest[..n].copy_from_slice(&bytes[..n]);
            n
        })?;
    }
    Ok(())
}

/// 把 `src` 拷贝到用户地址 `dst`
pub fn copy_out(space: &MemorySpace, dst: VirtAddr, src: &[u8]) -> KResult<()> {
    let mut done = 0;
    while done < src.len() {
        let rest = &src[done..];
        done += with_user_page(space, dst.add(done), true, |bytes| {
            let n = bytes.len().min(rest.len());
            bytes[..n].copy_from_slice(&rest[..n]);
            n
        })?;
    }
    Ok(())
}

/// 读取用户地址处的一个值，如系统调用号与参数
pub fn copy_in_value<T: Pod>(space: &MemorySpace, src: VirtAddr) -> KResult<T> {
    let mut value = T::zeroed();
    copy_in(space, src, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

/// 读取以 NUL 结尾的用户字符串，最多 `PAGE_SIZE` 字节，更长的部分被截断
///
/// 非 utf8 会返回 `EINVAL`
pub fn copy_in_string(space: &MemorySpace, src: VirtAddr) -> KResult<CompactString> {
    let mut bytes = Vec::new();
    loop {
        let va = src.add(bytes.len());
        let found_nul = with_user_page(space, va, false, |page| {
            let page = &page[..page.len().min(PAGE_SIZE - bytes.len())];
            match page.iter().position(|&b| b == 0) {
                Some(end) => {
                    bytes.extend_from_slice(&page[..end]);
                    true
                }
                None => {
                    bytes.extend_from_slice(page);
                    false
                }
            }
        })?;
        if found_nul || bytes.len() == PAGE_SIZE {
            break;
        }
    }
    CompactString::from_utf8(&bytes).map_err(|_| {
        warn!("user string at {src:?} is not utf8");
        errno::EINVAL
    })
}
