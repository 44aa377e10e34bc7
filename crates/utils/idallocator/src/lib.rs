#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bitmap;

use alloc::vec::Vec;

pub use self::bitmap::BitmapAllocator;

/// 基于回收的分配器，即用 vector 收集释放的 id
#[derive(Clone)]
pub struct RecycleAllocator {
    current: usize,
    recycled: Vec<usize>,
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecycleAllocator {
    /// 默认从 0 开始分配
    pub const fn new() -> Self {
        RecycleAllocator {
            current: 0,
            recycled: Vec::new(),
        }
    }

    /// 显式决定从哪个数开始分配
    pub const fn begin_with(begin: usize) -> Self {
        RecycleAllocator {
            current: begin,
            recycled: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }

    pub fn dealloc(&mut self, id: usize) {
        debug_assert!(id < self.current);
        debug_assert!(
            !self.recycled.iter().any(|i| *i == id),
            "id {id} has been deallocated!",
        );
        self.recycled.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::RecycleAllocator;

    #[test]
    fn recycled_id_is_reused() {
        let mut allocator = RecycleAllocator::begin_with(1);
        assert_eq!(allocator.alloc(), 1);
        assert_eq!(allocator.alloc(), 2);
        allocator.dealloc(1);
        assert_eq!(allocator.alloc(), 1);
        assert_eq!(allocator.alloc(), 3);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn double_dealloc_is_caught() {
        let mut allocator = RecycleAllocator::new();
        let id = allocator.alloc();
        allocator.dealloc(id);
        allocator.dealloc(id);
    }
}
