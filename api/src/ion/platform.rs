//! 平台相关的外部协作者
//!
//! 安全世界 (SMC) 调用、cache 维护和内核虚拟映射都通过 trait 注入，
//! 使分配器核心可以脱离真实硬件运行。

use alloc::sync::Arc;

use memory_addr::{PhysAddr, VirtAddr};

use super::{protect::ProtectionDescriptor, types::Chunk};

/// 安全世界接口
///
/// 单次往返调用，没有部分成功的语义。
pub trait TrustedWorld: Send + Sync {
    /// 请求保护描述符所描述的物理内存
    fn protect(&self, desc: &ProtectionDescriptor) -> bool;
    /// 请求解除保护
    fn unprotect(&self, desc: &ProtectionDescriptor) -> bool;
}

/// Cache 维护操作
pub trait CacheOps: Send + Sync {
    /// 刷新一段物理内存
    fn flush_range(&self, addr: PhysAddr, len: usize);
    /// 刷新一段 CPU 可见的数据（例如保护描述符本身）
    fn flush_bytes(&self, bytes: &[u8]);
    /// 将一段物理内存清零
    fn zero_range(&self, addr: PhysAddr, len: usize);
}

/// 内核虚拟地址映射
pub trait KernelMapper: Send + Sync {
    fn map(&self, chunks: &[Chunk]) -> Option<VirtAddr>;
    fn unmap(&self, vaddr: VirtAddr, chunks: &[Chunk]);
}

/// 接受所有请求的安全世界（无 TrustZone 的平台）
#[derive(Debug, Default)]
pub struct PermissiveTrustedWorld;

impl TrustedWorld for PermissiveTrustedWorld {
    fn protect(&self, desc: &ProtectionDescriptor) -> bool {
        trace!("protect iova={:#x} chunks={}", desc.iova(), desc.chunk_count());
        true
    }

    fn unprotect(&self, desc: &ProtectionDescriptor) -> bool {
        trace!("unprotect iova={:#x}", desc.iova());
        true
    }
}

/// 不做任何事的 cache 操作
#[derive(Debug, Default)]
pub struct NoopCache;

impl CacheOps for NoopCache {
    fn flush_range(&self, _addr: PhysAddr, _len: usize) {}

    fn flush_bytes(&self, _bytes: &[u8]) {}

    fn zero_range(&self, _addr: PhysAddr, _len: usize) {}
}

/// 线性映射：虚拟地址 = 物理地址 + 偏移
#[derive(Debug)]
pub struct LinearMapper {
    offset: usize,
}

impl LinearMapper {
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }
}

impl Default for LinearMapper {
    fn default() -> Self {
        Self::new(0xffff_ffc0_0000_0000)
    }
}

impl KernelMapper for LinearMapper {
    fn map(&self, chunks: &[Chunk]) -> Option<VirtAddr> {
        let first = chunks.first()?;
        Some(VirtAddr::from(first.start().wrapping_add(self.offset)))
    }

    fn unmap(&self, _vaddr: VirtAddr, _chunks: &[Chunk]) {}
}

/// 注入给分配器的平台协作者集合
#[derive(Clone)]
pub struct Platform {
    pub trusted: Arc<dyn TrustedWorld>,
    pub cache: Arc<dyn CacheOps>,
    pub mapper: Arc<dyn KernelMapper>,
}

impl Platform {
    pub fn with_trusted(trusted: Arc<dyn TrustedWorld>) -> Self {
        Self {
            trusted,
            ..Self::default()
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            trusted: Arc::new(PermissiveTrustedWorld),
            cache: Arc::new(NoopCache),
            mapper: Arc::new(LinearMapper::default()),
        }
    }
}
