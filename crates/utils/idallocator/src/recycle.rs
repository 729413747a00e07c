use alloc::vec::Vec;

/// 基于回收的分配器，即用 vector 收集释放的 id
///
/// 没有上限，适合 mmap 映射号这类数量不多、需要尽快复用的 id
#[derive(Clone, Debug)]
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
        debug_assert!(!self.recycled.contains(&id), "id {id} has been deallocated!");
        self.recycled.push(id);
    }
}
