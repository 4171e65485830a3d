//! CMA 堆：内核可迁移/可回收的连续内存区域
//!
//! 底层分配器即使有足够空闲字节，也可能因为页迁移失败或碎片而暂时失败，
//! 这种失败和真正耗尽一样报告为 `NoMemory`。

use alloc::{boxed::Box, string::String, vec, vec::Vec};

use memory_addr::{PhysAddr, align_up};
use spin::Mutex;

use super::{HeapBackend, check_region, pool::RangePool};
use crate::ion::{
    error::{IonError, IonResult},
    types::{Chunk, HeapFlags, IonFlags, IonHeapType, PAGE_SIZE},
};

/// 内核连续内存分配器接口（`cma_alloc`/`cma_release`）
pub trait ContiguousAllocator: Send + Sync {
    /// 分配 `count` 个页，起始地址按 `2^align_order` 页对齐；可能阻塞
    fn alloc(&self, count: usize, align_order: usize) -> Option<PhysAddr>;
    /// 归还页，地址不属于该区域时返回 `false`
    fn release(&self, addr: PhysAddr, count: usize) -> bool;
    fn base(&self) -> PhysAddr;
    fn size(&self) -> usize;
}

/// 基于区间池的 CMA 区域
pub struct CmaArea {
    pool: Mutex<RangePool>,
}

impl CmaArea {
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            pool: Mutex::new(RangePool::new(base, size, PAGE_SIZE)),
        }
    }
}

impl ContiguousAllocator for CmaArea {
    fn alloc(&self, count: usize, align_order: usize) -> Option<PhysAddr> {
        let align = PAGE_SIZE.checked_shl(align_order as u32)?;
        self.pool
            .lock()
            .alloc(count * PAGE_SIZE, align)
            .map(PhysAddr::from)
    }

    fn release(&self, addr: PhysAddr, count: usize) -> bool {
        self.pool.lock().free(addr.as_usize(), count * PAGE_SIZE)
    }

    fn base(&self) -> PhysAddr {
        PhysAddr::from(self.pool.lock().base())
    }

    fn size(&self) -> usize {
        self.pool.lock().size()
    }
}

/// CMA 堆配置
#[derive(Debug, Clone)]
pub struct CmaConfig {
    pub name: String,
    pub align: usize,
    pub untouchable: bool,
    pub secure: bool,
    pub protection_id: u32,
}

impl CmaConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            align: PAGE_SIZE,
            untouchable: false,
            secure: false,
            protection_id: 0,
        }
    }
}

/// CMA 堆
pub struct CmaHeap {
    name: String,
    align: usize,
    flags: HeapFlags,
    protection_id: u32,
    area: Box<dyn ContiguousAllocator>,
}

impl CmaHeap {
    pub fn new(config: CmaConfig, area: Box<dyn ContiguousAllocator>) -> IonResult<Self> {
        check_region(area.base().as_usize(), area.size(), config.align)?;
        let mut flags = HeapFlags::empty();
        flags.set(HeapFlags::SECURE, config.secure);
        flags.set(HeapFlags::UNTOUCHABLE, config.untouchable);
        Ok(Self {
            name: config.name,
            align: config.align,
            flags,
            protection_id: config.protection_id,
            area,
        })
    }
}

impl HeapBackend for CmaHeap {
    fn name(&self) -> &str {
        &self.name
    }

    fn heap_type(&self) -> IonHeapType {
        IonHeapType::Cma
    }

    fn flags(&self) -> HeapFlags {
        self.flags
    }

    fn size(&self) -> usize {
        self.area.size()
    }

    fn allocate(&self, size: usize, _flags: IonFlags) -> IonResult<Vec<Chunk>> {
        let size = align_up(size, self.align);
        let align_order = (self.align / PAGE_SIZE).trailing_zeros() as usize;
        let addr = self
            .area
            .alloc(size / PAGE_SIZE, align_order)
            .ok_or_else(|| {
                debug!("{}: cma_alloc of {:#x} bytes failed", self.name, size);
                IonError::NoMemory
            })?;
        Ok(vec![Chunk {
            addr,
            len: size,
        }])
    }

    fn free(&self, chunks: &[Chunk]) {
        for chunk in chunks {
            if !self.area.release(chunk.addr, chunk.len / PAGE_SIZE) {
                error!(
                    "{}: failed to release {:#x}+{:#x}",
                    self.name,
                    chunk.start(),
                    chunk.len
                );
            }
        }
    }

    fn protection_id(&self) -> u32 {
        self.protection_id
    }

    fn protection_align(&self) -> usize {
        self.align
    }

    fn region(&self) -> Option<(PhysAddr, usize)> {
        Some((self.area.base(), self.area.size()))
    }
}
