use alloc::{vec, vec::Vec};

use bit_field::BitArray;

/// 定长位图分配器
///
/// 交换槽等容量固定的资源用它管理。分配时从上次的位置继续往后找（next-fit），
/// 避免总是在低位反复分配、释放。
#[derive(Debug)]
pub struct BitmapAllocator {
    bits: Vec<u64>,
    capacity: usize,
    used: usize,
    cursor: usize,
}

impl BitmapAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            bits: vec![0; capacity.div_ceil(64)],
            capacity,
            used: 0,
            cursor: 0,
        }
    }

    /// 分配一个空闲位，满了返回 `None`
    pub fn alloc(&mut self) -> Option<usize> {
        if self.used == self.capacity {
            return None;
        }
        for step in 0..self.capacity {
            let index = (self.cursor + step) % self.capacity;
            if !self.bits.get_bit(index) {
                self.bits.set_bit(index, true);
                self.used += 1;
                self.cursor = (index + 1) % self.capacity;
                return Some(index);
            }
        }
        unreachable!("bitmap count says {} used of {}", self.used, self.capacity)
    }

    /// # Panics
    ///
    /// 释放一个本就空闲的位视为内核 bug
    pub fn dealloc(&mut self, index: usize) {
        assert!(index < self.capacity, "index {index} out of range");
        assert!(self.bits.get_bit(index), "index {index} has been deallocated!");
        self.bits.set_bit(index, false);
        self.used -= 1;
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        index < self.capacity && self.bits.get_bit(index)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }
}
