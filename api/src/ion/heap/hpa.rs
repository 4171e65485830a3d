//! HPA 堆：从通用页分配器申请固定阶数的页块
//!
//! 缓冲区由多个 `HPA_CHUNK_SIZE` 大小的块组成，块地址排序后交给安全世界
//! 校验。受保护的分配会避开配置中排除的物理区间。

use alloc::{string::String, sync::Arc, vec::Vec};

use memory_addr::{PhysAddrRange, align_up};

use super::{HeapBackend, page::PageAllocator};
use crate::ion::{
    error::{IonError, IonResult},
    types::{Chunk, HeapFlags, IonFlags, IonHeapType, PAGE_SIZE},
};

/// 每个块的阶数（16 页）
pub const HPA_CHUNK_ORDER: usize = 4;
/// 每个块的字节数
pub const HPA_CHUNK_SIZE: usize = PAGE_SIZE << HPA_CHUNK_ORDER;
/// 单个缓冲区最多的块数，限制保护描述符中地址数组的大小
pub const HPA_MAX_CHUNK_COUNT: usize = PAGE_SIZE * 2 / core::mem::size_of::<u64>();

/// HPA 堆配置
#[derive(Debug, Clone)]
pub struct HpaConfig {
    pub name: String,
    pub untouchable: bool,
    pub secure: bool,
    pub protection_id: u32,
    /// 受保护分配不得使用的物理区间
    pub exclusions: Vec<PhysAddrRange>,
}

impl HpaConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            untouchable: false,
            secure: true,
            protection_id: 0,
            exclusions: Vec::new(),
        }
    }
}

/// HPA 堆
pub struct HpaHeap {
    name: String,
    flags: HeapFlags,
    protection_id: u32,
    exclusions: Vec<PhysAddrRange>,
    pages: Arc<dyn PageAllocator>,
}

impl HpaHeap {
    pub fn new(config: HpaConfig, pages: Arc<dyn PageAllocator>) -> Self {
        let mut flags = HeapFlags::DEFER_FREE;
        flags.set(HeapFlags::SECURE, config.secure);
        flags.set(HeapFlags::UNTOUCHABLE, config.untouchable);
        Self {
            name: config.name,
            flags,
            protection_id: config.protection_id,
            exclusions: config.exclusions,
            pages,
        }
    }

    fn is_excluded(&self, chunk: &Chunk) -> bool {
        self.exclusions
            .iter()
            .any(|range| chunk.overlaps(range.start.as_usize(), range.end.as_usize()))
    }

    fn release_chunks(&self, chunks: &[Chunk]) {
        for chunk in chunks {
            self.pages.free_pages(chunk.addr, HPA_CHUNK_ORDER);
        }
    }
}

impl HeapBackend for HpaHeap {
    fn name(&self) -> &str {
        &self.name
    }

    fn heap_type(&self) -> IonHeapType {
        IonHeapType::Hpa
    }

    fn flags(&self) -> HeapFlags {
        self.flags
    }

    fn size(&self) -> usize {
        self.pages.total_bytes()
    }

    fn allocate(&self, size: usize, flags: IonFlags) -> IonResult<Vec<Chunk>> {
        let count = align_up(size, HPA_CHUNK_SIZE) / HPA_CHUNK_SIZE;
        if count > HPA_MAX_CHUNK_COUNT {
            warn!(
                "{}: {} chunks requested, at most {} allowed",
                self.name, count, HPA_MAX_CHUNK_COUNT
            );
            return Err(IonError::InvalidArg);
        }
        let avoid_excluded = flags.contains(IonFlags::PROTECTED) && !self.exclusions.is_empty();

        let mut chunks = Vec::with_capacity(count);
        // 落在排除区间内的块先扣住，防止页分配器再次给出同一块
        let mut rejected = Vec::new();
        while chunks.len() < count {
            let Some(addr) = self.pages.alloc_pages(HPA_CHUNK_ORDER) else {
                break;
            };
            let chunk = Chunk {
                addr,
                len: HPA_CHUNK_SIZE,
            };
            if avoid_excluded && self.is_excluded(&chunk) {
                rejected.push(chunk);
            } else {
                chunks.push(chunk);
            }
        }
        self.release_chunks(&rejected);

        if chunks.len() < count {
            debug!(
                "{}: only {}/{} chunks available",
                self.name,
                chunks.len(),
                count
            );
            self.release_chunks(&chunks);
            return Err(IonError::NoMemory);
        }

        chunks.sort_unstable_by_key(Chunk::start);
        Ok(chunks)
    }

    fn free(&self, chunks: &[Chunk]) {
        self.release_chunks(chunks);
    }

    fn protection_id(&self) -> u32 {
        self.protection_id
    }

    fn protection_align(&self) -> usize {
        HPA_CHUNK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ion::heap::page::BuddyPageAllocator;

    fn heap_with(exclusions: Vec<PhysAddrRange>, base: usize, chunks: usize) -> HpaHeap {
        let pages = Arc::new(BuddyPageAllocator::new(base, chunks * HPA_CHUNK_SIZE));
        let mut config = HpaConfig::new("hpa");
        config.exclusions = exclusions;
        HpaHeap::new(config, pages)
    }

    #[test]
    fn chunks_are_sorted_and_uniform() {
        let heap = heap_with(Vec::new(), 0x8000_0000, 64);
        let a = heap.allocate(HPA_CHUNK_SIZE, IonFlags::empty()).unwrap();
        let b = heap.allocate(5 * HPA_CHUNK_SIZE - PAGE_SIZE, IonFlags::empty()).unwrap();
        assert_eq!(b.len(), 5);
        assert!(b.windows(2).all(|w| w[0].start() < w[1].start()));
        assert!(b.iter().all(|c| c.len == HPA_CHUNK_SIZE));
        heap.free(&a);
        heap.free(&b);
    }

    #[test]
    fn too_many_chunks() {
        let heap = heap_with(Vec::new(), 0x8000_0000, 4);
        let size = (HPA_MAX_CHUNK_COUNT + 1) * HPA_CHUNK_SIZE;
        assert_eq!(heap.allocate(size, IonFlags::empty()), Err(IonError::InvalidArg));
    }

    #[test]
    fn failed_allocation_returns_every_chunk() {
        let heap = heap_with(Vec::new(), 0x8000_0000, 4);
        assert_eq!(
            heap.allocate(5 * HPA_CHUNK_SIZE, IonFlags::empty()),
            Err(IonError::NoMemory)
        );
        let all = heap.allocate(4 * HPA_CHUNK_SIZE, IonFlags::empty()).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn protected_allocation_skips_excluded_range() {
        let base = 0x8000_0000;
        let excluded = PhysAddrRange::from_start_size(base.into(), 2 * HPA_CHUNK_SIZE);
        let heap = heap_with(vec![excluded], base, 4);

        let chunks = heap
            .allocate(2 * HPA_CHUNK_SIZE, IonFlags::PROTECTED)
            .unwrap();
        assert!(chunks.iter().all(|c| c.start() >= base + 2 * HPA_CHUNK_SIZE));
        // 排除区间中的块不够再满足一个受保护的请求
        assert_eq!(
            heap.allocate(HPA_CHUNK_SIZE, IonFlags::PROTECTED),
            Err(IonError::NoMemory)
        );
        // 普通分配可以使用排除区间
        let plain = heap.allocate(2 * HPA_CHUNK_SIZE, IonFlags::empty()).unwrap();
        assert!(plain.iter().all(|c| c.start() < base + 2 * HPA_CHUNK_SIZE));
    }
}
