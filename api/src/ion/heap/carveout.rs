//! Carveout 堆：预留的单段物理连续区域

use alloc::{string::String, vec, vec::Vec};

use memory_addr::{PhysAddr, align_up};
use spin::Mutex;

use super::{HeapBackend, check_region, pool::RangePool};
use crate::ion::{
    error::{IonError, IonResult},
    types::{Chunk, HeapFlags, IonFlags, IonHeapType, PAGE_SIZE},
};

/// Carveout 堆配置
#[derive(Debug, Clone)]
pub struct CarveoutConfig {
    pub name: String,
    pub base: usize,
    pub size: usize,
    /// 每次分配的最小对齐
    pub align: usize,
    pub untouchable: bool,
    /// 支持安全保护
    pub secure: bool,
    pub protection_id: u32,
}

impl CarveoutConfig {
    pub fn new(name: &str, base: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            base,
            size,
            align: PAGE_SIZE,
            untouchable: false,
            secure: false,
            protection_id: 0,
        }
    }
}

/// Carveout 堆
pub struct CarveoutHeap {
    name: String,
    base: usize,
    size: usize,
    align: usize,
    flags: HeapFlags,
    protection_id: u32,
    pool: Mutex<RangePool>,
}

impl CarveoutHeap {
    pub fn new(config: CarveoutConfig) -> IonResult<Self> {
        check_region(config.base, config.size, config.align)?;
        let mut flags = HeapFlags::empty();
        flags.set(HeapFlags::SECURE, config.secure);
        flags.set(HeapFlags::UNTOUCHABLE, config.untouchable);
        Ok(Self {
            name: config.name,
            base: config.base,
            size: config.size,
            align: config.align,
            flags,
            protection_id: config.protection_id,
            pool: Mutex::new(RangePool::new(config.base, config.size, PAGE_SIZE)),
        })
    }

    pub fn free_bytes(&self) -> usize {
        self.pool.lock().free_bytes()
    }

    /// 空闲区间快照
    pub fn free_ranges(&self) -> Vec<(usize, usize)> {
        self.pool.lock().free_ranges()
    }
}

impl HeapBackend for CarveoutHeap {
    fn name(&self) -> &str {
        &self.name
    }

    fn heap_type(&self) -> IonHeapType {
        IonHeapType::Carveout
    }

    fn flags(&self) -> HeapFlags {
        self.flags
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allocate(&self, size: usize, _flags: IonFlags) -> IonResult<Vec<Chunk>> {
        let size = align_up(size, self.align);
        let addr = self.pool.lock().alloc(size, self.align).ok_or_else(|| {
            debug!("{}: failed to allocate {:#x} bytes", self.name, size);
            IonError::NoMemory
        })?;
        Ok(vec![Chunk::new(addr, size)])
    }

    fn free(&self, chunks: &[Chunk]) {
        let mut pool = self.pool.lock();
        for chunk in chunks {
            if !pool.free(chunk.start(), chunk.len) {
                error!(
                    "{}: freeing invalid range {:#x}+{:#x}",
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
        Some((PhysAddr::from(self.base), self.size))
    }
}
