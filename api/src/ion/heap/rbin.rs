//! RBIN 堆：可回收的预留区域
//!
//! 后备区域在空闲时由内核借用。两个后台线程维护按阶分组的页池：
//!
//! - prereclaim：被唤醒后把后备区域中的空闲区间按伙伴对齐切块放入页池，
//!   直到区域中没有可回收的区间；
//! - shrink：内存压力时从页池中取出页块归还给后备区域。
//!
//! 分配优先取页池，页池为空时直接从后备区域取。释放的块回到它的来源：
//! 页池块与池中的伙伴逐阶合并，区域块还给后备区域。
//!
//! 任意静止时刻都满足
//! `pooled_pages + allocated_pages + free_region_pages == total_pages`。

use alloc::{collections::BTreeSet, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use memory_addr::PhysAddr;
use spin::Mutex;

use super::{HeapBackend, check_region, pool::RangePool};
use crate::ion::{
    daemon::ReclaimDaemon,
    error::{IonError, IonResult},
    types::{Chunk, HeapFlags, IonFlags, IonHeapType, PAGE_SIZE},
};

/// 页池数量（阶 0..=10）
pub const RBIN_NUM_ORDERS: usize = 11;
const RBIN_MAX_ORDER: usize = RBIN_NUM_ORDERS - 1;

fn floor_log2(n: usize) -> usize {
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

/// RBIN 堆配置
#[derive(Debug, Clone)]
pub struct RbinConfig {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

impl RbinConfig {
    pub fn new(name: &str, base: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            base,
            size,
        }
    }
}

/// 页计数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbinStats {
    pub total_pages: usize,
    pub pooled_pages: usize,
    pub allocated_pages: usize,
    pub free_region_pages: usize,
    /// 每个阶的页池中的块数
    pub pool_lengths: [usize; RBIN_NUM_ORDERS],
}

impl RbinStats {
    pub fn is_conserved(&self) -> bool {
        self.pooled_pages + self.allocated_pages + self.free_region_pages == self.total_pages
    }
}

struct RbinInner {
    name: String,
    base: usize,
    end: usize,
    total_pages: usize,
    region: Mutex<RangePool>,
    /// 直接从后备区域取出的分配块的起始地址，释放时还给区域
    region_chunks: Mutex<BTreeSet<usize>>,
    pools: [Mutex<Vec<usize>>; RBIN_NUM_ORDERS],
    pooled_pages: AtomicUsize,
    allocated_pages: AtomicUsize,
    /// shrink 线程下一轮要归还的页数
    shrink_target: AtomicUsize,
}

impl RbinInner {
    fn push_pool(&self, addr: usize, order: usize) {
        self.pools[order].lock().push(addr);
        self.pooled_pages.fetch_add(1 << order, Ordering::SeqCst);
    }

    fn pop_pool(&self, order: usize) -> Option<usize> {
        let addr = self.pools[order].lock().pop()?;
        self.pooled_pages.fetch_sub(1 << order, Ordering::SeqCst);
        Some(addr)
    }

    /// 把一个块放回页池，伙伴也在池中时逐阶向上合并
    fn release_block(&self, mut addr: usize, mut order: usize) {
        while order < RBIN_MAX_ORDER {
            let buddy = addr ^ (PAGE_SIZE << order);
            {
                let mut pool = self.pools[order].lock();
                let Some(pos) = pool.iter().position(|&block| block == buddy) else {
                    break;
                };
                pool.remove(pos);
            }
            self.pooled_pages.fetch_sub(1 << order, Ordering::SeqCst);
            addr = addr.min(buddy);
            order += 1;
        }
        self.push_pool(addr, order);
    }

    /// 把 `[addr, addr + pages)` 按伙伴对齐切块放入页池
    fn donate_extent(&self, mut addr: usize, mut pages: usize) {
        while pages > 0 {
            let align_order = (addr / PAGE_SIZE).trailing_zeros() as usize;
            let order = RBIN_MAX_ORDER.min(align_order).min(floor_log2(pages));
            self.release_block(addr, order);
            addr += PAGE_SIZE << order;
            pages -= 1 << order;
        }
    }

    /// 拆分 `high` 阶的块，只保留低地址的 `low` 阶部分，其余放回页池
    fn do_expand(&self, addr: usize, low: usize, high: usize) {
        let mut order = high;
        while order > low {
            order -= 1;
            self.push_pool(addr + (PAGE_SIZE << order), order);
        }
    }

    /// 从页池取一块：同阶，更高阶（拆分），最后接受更低阶
    fn take_from_pools(&self, order: usize) -> Option<(usize, usize)> {
        if let Some(addr) = self.pop_pool(order) {
            return Some((addr, order));
        }
        for high in order + 1..RBIN_NUM_ORDERS {
            if let Some(addr) = self.pop_pool(high) {
                self.do_expand(addr, order, high);
                return Some((addr, order));
            }
        }
        (0..order)
            .rev()
            .find_map(|low| self.pop_pool(low).map(|addr| (addr, low)))
    }

    fn allocate(&self, pages: usize) -> Option<Vec<Chunk>> {
        let mut chunks = Vec::new();
        let mut left = pages;
        while left > 0 {
            let order = RBIN_MAX_ORDER.min(floor_log2(left));
            if let Some((addr, got)) = self.take_from_pools(order) {
                chunks.push(Chunk::new(addr, PAGE_SIZE << got));
                self.allocated_pages.fetch_add(1 << got, Ordering::SeqCst);
                left -= 1 << got;
                continue;
            }
            // 页池已空，直接从后备区域取
            let extent = self.region.lock().take_extent(left * PAGE_SIZE);
            let Some((addr, len)) = extent else {
                self.free(&chunks);
                return None;
            };
            self.region_chunks.lock().insert(addr);
            chunks.push(Chunk::new(addr, len));
            self.allocated_pages
                .fetch_add(len / PAGE_SIZE, Ordering::SeqCst);
            left -= len / PAGE_SIZE;
        }
        Some(chunks)
    }

    /// 页池中取出的块回到页池，后备区域中取出的块回到区域
    fn free(&self, chunks: &[Chunk]) {
        for chunk in chunks {
            if chunk.start() < self.base || chunk.end() > self.end {
                error!(
                    "{}: freeing invalid range {:#x}+{:#x}",
                    self.name,
                    chunk.start(),
                    chunk.len
                );
                continue;
            }
            if self.region_chunks.lock().remove(&chunk.start()) {
                if !self.region.lock().free(chunk.start(), chunk.len) {
                    error!(
                        "{}: region chunk {:#x} freed twice",
                        self.name,
                        chunk.start()
                    );
                    continue;
                }
            } else {
                self.donate_extent(chunk.start(), chunk.len / PAGE_SIZE);
            }
            self.allocated_pages
                .fetch_sub(chunk.len / PAGE_SIZE, Ordering::SeqCst);
        }
    }

    /// 把后备区域中所有空闲区间放入页池，返回放入的页数
    fn prereclaim_pass(&self) -> usize {
        let mut donated = 0;
        loop {
            let extent = self.region.lock().take_extent(usize::MAX);
            let Some((addr, len)) = extent else {
                break;
            };
            self.donate_extent(addr, len / PAGE_SIZE);
            donated += len / PAGE_SIZE;
        }
        debug!("{}: prereclaim moved {} pages into pools", self.name, donated);
        donated
    }

    /// 从页池归还至少 `shrink_target` 页给后备区域，返回归还的页数
    fn shrink_pass(&self) -> usize {
        let target = self.shrink_target.swap(0, Ordering::SeqCst);
        let mut reclaimed = 0;
        'pools: for order in 0..RBIN_NUM_ORDERS {
            while reclaimed < target {
                let Some(addr) = self.pop_pool(order) else {
                    continue 'pools;
                };
                if !self.region.lock().free(addr, PAGE_SIZE << order) {
                    error!("{}: pooled block {:#x} overlaps region", self.name, addr);
                }
                reclaimed += 1 << order;
            }
            break;
        }
        debug!("{}: shrink returned {} pages", self.name, reclaimed);
        reclaimed
    }

    fn stats(&self) -> RbinStats {
        let mut pool_lengths = [0; RBIN_NUM_ORDERS];
        for (len, pool) in pool_lengths.iter_mut().zip(&self.pools) {
            *len = pool.lock().len();
        }
        RbinStats {
            total_pages: self.total_pages,
            pooled_pages: self.pooled_pages.load(Ordering::SeqCst),
            allocated_pages: self.allocated_pages.load(Ordering::SeqCst),
            free_region_pages: self.region.lock().free_bytes() / PAGE_SIZE,
            pool_lengths,
        }
    }
}

/// RBIN 堆
pub struct RbinHeap {
    base: usize,
    size: usize,
    inner: Arc<RbinInner>,
    prereclaim: ReclaimDaemon,
    shrinker: ReclaimDaemon,
}

impl RbinHeap {
    /// 创建堆并启动两个后台线程
    pub fn new(config: RbinConfig) -> IonResult<Self> {
        check_region(config.base, config.size, PAGE_SIZE)?;
        let inner = Arc::new(RbinInner {
            base: config.base,
            end: config.base + config.size,
            region_chunks: Mutex::new(BTreeSet::new()),
            total_pages: config.size / PAGE_SIZE,
            region: Mutex::new(RangePool::new(config.base, config.size, PAGE_SIZE)),
            pools: core::array::from_fn(|_| Mutex::new(Vec::new())),
            pooled_pages: AtomicUsize::new(0),
            allocated_pages: AtomicUsize::new(0),
            shrink_target: AtomicUsize::new(0),
            name: config.name,
        });
        let prereclaim = ReclaimDaemon::spawn(&alloc::format!("{}_prereclaim", inner.name), {
            let inner = inner.clone();
            move || {
                inner.prereclaim_pass();
            }
        })?;
        let shrinker = ReclaimDaemon::spawn(&alloc::format!("{}_shrink", inner.name), {
            let inner = inner.clone();
            move || {
                inner.shrink_pass();
            }
        })?;
        Ok(Self {
            base: config.base,
            size: config.size,
            inner,
            prereclaim,
            shrinker,
        })
    }

    /// 唤醒 prereclaim 线程
    pub fn wake_prereclaim(&self) {
        self.prereclaim.wake();
    }

    /// 唤醒 shrink 线程归还 `target_pages` 页（`usize::MAX` 表示清空页池）
    pub fn wake_shrink(&self, target_pages: usize) {
        self.inner
            .shrink_target
            .fetch_max(target_pages, Ordering::SeqCst);
        self.shrinker.wake();
    }

    /// 等待两个后台线程都处于空闲
    pub fn wait_idle(&self) {
        self.prereclaim.wait_idle();
        self.shrinker.wait_idle();
    }

    /// 两个后台线程累计完成的轮数
    pub fn daemon_passes(&self) -> (usize, usize) {
        (self.prereclaim.passes(), self.shrinker.passes())
    }

    /// 在调用线程上执行一轮 prereclaim
    pub fn prereclaim(&self) -> usize {
        self.inner.prereclaim_pass()
    }

    /// 在调用线程上执行一轮 shrink
    pub fn shrink_pools(&self, target_pages: usize) -> usize {
        self.inner
            .shrink_target
            .fetch_max(target_pages, Ordering::SeqCst);
        self.inner.shrink_pass()
    }

    pub fn stats(&self) -> RbinStats {
        self.inner.stats()
    }
}

impl HeapBackend for RbinHeap {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn heap_type(&self) -> IonHeapType {
        IonHeapType::Rbin
    }

    fn flags(&self) -> HeapFlags {
        HeapFlags::DEFER_FREE
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allocate(&self, size: usize, _flags: IonFlags) -> IonResult<Vec<Chunk>> {
        self.inner.allocate(size / PAGE_SIZE).ok_or_else(|| {
            debug!("{}: failed to allocate {:#x} bytes", self.inner.name, size);
            IonError::NoMemory
        })
    }

    fn free(&self, chunks: &[Chunk]) {
        self.inner.free(chunks);
    }

    fn region(&self) -> Option<(PhysAddr, usize)> {
        Some((PhysAddr::from(self.base), self.size))
    }

    /// 只唤醒 shrink 线程，页池在后台归还
    fn shrink(&self, target: usize) -> usize {
        self.wake_shrink(target.div_ceil(PAGE_SIZE));
        0
    }
}
