//! 页分配器
//!
//! HPA 堆从通用页分配器申请固定阶数的页块。这里的伙伴系统实现供没有真实
//! 页分配器的平台和测试使用。

use alloc::{collections::BTreeSet, vec::Vec};

use memory_addr::PhysAddr;
use spin::Mutex;

use crate::ion::types::PAGE_SIZE;

/// 最大阶数
pub const MAX_ORDER: usize = 10;

/// 通用页分配器接口
pub trait PageAllocator: Send + Sync {
    /// 分配 `2^order` 个连续页
    fn alloc_pages(&self, order: usize) -> Option<PhysAddr>;
    /// 归还 `alloc_pages` 得到的页块
    fn free_pages(&self, addr: PhysAddr, order: usize);
    /// 管理的总字节数
    fn total_bytes(&self) -> usize;
}

struct BuddyInner {
    free_area: [BTreeSet<usize>; MAX_ORDER + 1],
    free_pages: usize,
}

/// 伙伴系统页分配器
pub struct BuddyPageAllocator {
    base: usize,
    size: usize,
    inner: Mutex<BuddyInner>,
}

impl BuddyPageAllocator {
    /// 管理 `[base, base + size)`，两者必须按页对齐
    pub fn new(base: usize, size: usize) -> Self {
        debug_assert!(base % PAGE_SIZE == 0 && size % PAGE_SIZE == 0);
        let mut inner = BuddyInner {
            free_area: Default::default(),
            free_pages: size / PAGE_SIZE,
        };
        let end = base + size;
        let mut addr = base;
        while addr < end {
            let mut order = MAX_ORDER;
            while order > 0
                && (addr % (PAGE_SIZE << order) != 0 || addr + (PAGE_SIZE << order) > end)
            {
                order -= 1;
            }
            inner.free_area[order].insert(addr);
            addr += PAGE_SIZE << order;
        }
        Self {
            base,
            size,
            inner: Mutex::new(inner),
        }
    }

    pub fn free_pages_count(&self) -> usize {
        self.inner.lock().free_pages
    }

    /// 每个阶的空闲块地址
    pub fn free_lists(&self) -> Vec<Vec<usize>> {
        self.inner
            .lock()
            .free_area
            .iter()
            .map(|area| area.iter().copied().collect())
            .collect()
    }
}

impl PageAllocator for BuddyPageAllocator {
    fn alloc_pages(&self, order: usize) -> Option<PhysAddr> {
        if order > MAX_ORDER {
            return None;
        }
        let mut inner = self.inner.lock();
        let mut current = (order..=MAX_ORDER).find(|&o| !inner.free_area[o].is_empty())?;
        let addr = inner.free_area[current].pop_first()?;
        while current > order {
            current -= 1;
            inner.free_area[current].insert(addr + (PAGE_SIZE << current));
        }
        inner.free_pages -= 1 << order;
        Some(PhysAddr::from(addr))
    }

    fn free_pages(&self, addr: PhysAddr, order: usize) {
        let end = self.base + self.size;
        let mut addr = addr.as_usize();
        let mut order = order;
        let mut inner = self.inner.lock();
        inner.free_pages += 1 << order;
        while order < MAX_ORDER {
            let buddy = addr ^ (PAGE_SIZE << order);
            if buddy < self.base || buddy + (PAGE_SIZE << order) > end {
                break;
            }
            if !inner.free_area[order].remove(&buddy) {
                break;
            }
            addr = addr.min(buddy);
            order += 1;
        }
        inner.free_area[order].insert(addr);
    }

    fn total_bytes(&self) -> usize {
        self.size
    }
}
