use alloc::{vec, vec::Vec};

const BITS: usize = u64::BITS as usize;

/// 固定容量的位图分配器，`false` 代表空闲
///
/// 用于 swap slot 这种数量在初始化时就确定的资源
pub struct BitmapAllocator {
    words: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl BitmapAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(BITS)],
            capacity,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已被占用的位的数量
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.capacity, "bit {idx} out of range");
        self.words[idx / BITS] & (1 << (idx % BITS)) != 0
    }

    /// 找到第一个空闲位，将其置位并返回其下标
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        let (word_idx, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = word.trailing_ones() as usize;
        let idx = word_idx * BITS + bit;
        // 最后一个字中超出容量的部分不可分配
        if idx >= self.capacity {
            return None;
        }
        *word |= 1 << bit;
        self.used += 1;
        Some(idx)
    }

    /// 释放一个已被占用的位
    pub fn reset(&mut self, idx: usize) {
        assert!(self.test(idx), "bit {idx} is not in use");
        self.words[idx / BITS] &= !(1 << (idx % BITS));
        self.used -= 1;
    }
}
