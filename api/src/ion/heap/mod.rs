//! Ion 堆后端
//!
//! 每个堆绑定一段物理内存（或一个页来源）和一种分配策略。注册表通过
//! [`HeapBackend`] trait 对象分发，需要具体类型时用 `downcast_ref` 取回。

mod carveout;
mod cma;
mod hpa;
pub mod page;
pub mod pool;
mod rbin;

use alloc::vec::Vec;

use downcast_rs::{DowncastSync, impl_downcast};
use memory_addr::{PhysAddr, VirtAddr};

pub use self::{
    carveout::{CarveoutConfig, CarveoutHeap},
    cma::{CmaArea, CmaConfig, CmaHeap, ContiguousAllocator},
    hpa::{HPA_CHUNK_ORDER, HPA_CHUNK_SIZE, HPA_MAX_CHUNK_COUNT, HpaConfig, HpaHeap},
    rbin::{RBIN_NUM_ORDERS, RbinConfig, RbinHeap, RbinStats},
};
use super::{
    error::{IonError, IonResult},
    platform::KernelMapper,
    types::{Chunk, HeapFlags, IonFlags, IonHeapType, PAGE_SIZE},
};

/// 堆后端接口
pub trait HeapBackend: DowncastSync {
    fn name(&self) -> &str;

    fn heap_type(&self) -> IonHeapType;

    fn flags(&self) -> HeapFlags;

    /// 堆管理的总字节数
    fn size(&self) -> usize;

    /// 分配至少 `size` 字节（已按页对齐），返回组成缓冲区的物理块
    fn allocate(&self, size: usize, flags: IonFlags) -> IonResult<Vec<Chunk>>;

    /// 归还 `allocate` 得到的物理块
    fn free(&self, chunks: &[Chunk]);

    /// 传给安全世界的保护类别
    fn protection_id(&self) -> u32 {
        0
    }

    /// 安全 IOVA 的对齐要求
    fn protection_align(&self) -> usize {
        PAGE_SIZE
    }

    /// 物理连续堆的区域，用于碎片诊断
    fn region(&self) -> Option<(PhysAddr, usize)> {
        None
    }

    /// 内存压力下释放池化的内存，返回同步回收的字节数
    fn shrink(&self, _target: usize) -> usize {
        0
    }

    fn map_kernel(&self, chunks: &[Chunk], mapper: &dyn KernelMapper) -> IonResult<VirtAddr> {
        mapper.map(chunks).ok_or(IonError::NoMemory)
    }

    fn unmap_kernel(&self, vaddr: VirtAddr, chunks: &[Chunk], mapper: &dyn KernelMapper) {
        mapper.unmap(vaddr, chunks)
    }
}

impl_downcast!(sync HeapBackend);

/// 检查堆配置中的区域参数
fn check_region(base: usize, size: usize, align: usize) -> IonResult<()> {
    if size == 0 || !align.is_power_of_two() || align < PAGE_SIZE {
        return Err(IonError::InvalidArg);
    }
    if base % align != 0 || size % PAGE_SIZE != 0 || base.checked_add(size).is_none() {
        return Err(IonError::InvalidArg);
    }
    Ok(())
}
