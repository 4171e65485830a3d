//! 缓冲区保护服务
//!
//! 为受保护缓冲区预留安全 IOVA，构造保护描述符并请求安全世界保护。
//!
//! 解除保护失败时 IOVA **不会**归还：安全世界可能仍认为该地址段受保护，
//! 宁可永久泄漏这段地址也不能让它被复用。

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use memory_addr::PhysAddr;
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use super::{
    error::{IonError, IonResult},
    iova::IovaPool,
    platform::{CacheOps, TrustedWorld},
    types::Chunk,
};

/// 交给安全世界的保护信息，布局与安全世界约定一致
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, Immutable, KnownLayout)]
pub struct BufferProtInfo {
    pub chunk_count: u32,
    pub dma_addr: u32,
    pub flags: u32,
    pub chunk_size: u32,
    /// 单块时为块的物理地址，多块时为地址数组的地址
    pub bus_address: u64,
}

/// 描述符中的物理地址
#[derive(Debug)]
enum ProtAddrs {
    Single(PhysAddr),
    Array(Box<[u64]>),
}

/// 保护描述符
///
/// 只在缓冲区受保护期间存在。保护信息和地址数组都放在堆上，描述符移动时
/// 安全世界看到的地址不变。
#[derive(Debug)]
pub struct ProtectionDescriptor {
    protection_id: u32,
    chunk_size: usize,
    addrs: ProtAddrs,
    iova: usize,
    info: Box<BufferProtInfo>,
}

impl ProtectionDescriptor {
    pub fn protection_id(&self) -> u32 {
        self.protection_id
    }

    pub fn chunk_count(&self) -> usize {
        match &self.addrs {
            ProtAddrs::Single(_) => 1,
            ProtAddrs::Array(addrs) => addrs.len(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_size(&self) -> usize {
        self.chunk_size * self.chunk_count()
    }

    /// 分配给该缓冲区的安全设备地址
    pub fn iova(&self) -> usize {
        self.iova
    }

    /// 受保护的物理块地址
    pub fn phys_addrs(&self) -> Vec<PhysAddr> {
        match &self.addrs {
            ProtAddrs::Single(addr) => alloc::vec![*addr],
            ProtAddrs::Array(addrs) => addrs
                .iter()
                .map(|&addr| PhysAddr::from(addr as usize))
                .collect(),
        }
    }

    /// 交给安全世界的保护信息
    pub fn info(&self) -> &BufferProtInfo {
        &self.info
    }
}

/// 保护/解除保护协议
pub struct ProtectionService {
    iova: IovaPool,
    trusted: Arc<dyn TrustedWorld>,
    cache: Arc<dyn CacheOps>,
}

impl ProtectionService {
    pub fn new(iova: IovaPool, trusted: Arc<dyn TrustedWorld>, cache: Arc<dyn CacheOps>) -> Self {
        Self {
            iova,
            trusted,
            cache,
        }
    }

    pub fn iova_pool(&self) -> &IovaPool {
        &self.iova
    }

    /// 保护 `chunks`
    ///
    /// 多块时所有块必须等长。安全世界拒绝时释放 IOVA 并返回
    /// `ProtectionRejected`，这一层不重试。
    pub fn protect(
        &self,
        protection_id: u32,
        chunks: &[Chunk],
        align: usize,
    ) -> IonResult<ProtectionDescriptor> {
        let first = chunks.first().ok_or(IonError::InvalidArg)?;
        let chunk_size = first.len;
        if chunks.iter().any(|chunk| chunk.len != chunk_size) {
            return Err(IonError::InvalidArg);
        }
        let (Ok(info_chunk_size), Ok(chunk_count)) =
            (u32::try_from(chunk_size), u32::try_from(chunks.len()))
        else {
            return Err(IonError::InvalidArg);
        };

        let total = chunk_size * chunks.len();
        let iova = self.iova.alloc(total, align)?;
        let dma_addr = u32::try_from(iova).map_err(|_| {
            self.iova.free(iova, total);
            IonError::InvalidArg
        })?;
        let addrs = match chunks {
            [single] => ProtAddrs::Single(single.addr),
            _ => ProtAddrs::Array(
                chunks
                    .iter()
                    .map(|chunk| chunk.start() as u64)
                    .collect(),
            ),
        };
        let bus_address = match &addrs {
            ProtAddrs::Single(addr) => addr.as_usize() as u64,
            ProtAddrs::Array(addrs) => addrs.as_ptr() as u64,
        };
        let desc = ProtectionDescriptor {
            protection_id,
            chunk_size,
            addrs,
            iova,
            info: Box::new(BufferProtInfo {
                chunk_count,
                dma_addr,
                flags: protection_id,
                chunk_size: info_chunk_size,
                bus_address,
            }),
        };

        // 安全世界直接读取内存中的描述符
        self.cache.flush_bytes(desc.info.as_bytes());
        if let ProtAddrs::Array(addrs) = &desc.addrs {
            self.cache.flush_bytes(addrs.as_bytes());
        }

        if !self.trusted.protect(&desc) {
            warn!(
                "protection rejected: id={} chunks={} size={:#x}",
                protection_id,
                desc.chunk_count(),
                total
            );
            self.iova.free(iova, total);
            return Err(IonError::ProtectionRejected);
        }
        debug!(
            "protected {} chunk(s) of {:#x} at iova {:#x}",
            desc.chunk_count(),
            chunk_size,
            iova
        );
        Ok(desc)
    }

    /// 解除保护
    ///
    /// 成功时归还 IOVA，调用者随后丢弃描述符（释放地址数组）。失败时 IOVA
    /// 保持预留，描述符应当继续保留。
    pub fn unprotect(&self, desc: &ProtectionDescriptor) -> IonResult<()> {
        if !self.trusted.unprotect(desc) {
            error!(
                "unprotect failed: iova {:#x}+{:#x} is leaked",
                desc.iova,
                desc.total_size()
            );
            return Err(IonError::UnprotectFailed);
        }
        self.iova.free(desc.iova, desc.total_size());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::ion::platform::NoopCache;

    /// 记录每次刷新的 `(地址, 长度)`
    #[derive(Default)]
    struct RecordingCache {
        flushed: Mutex<Vec<(usize, usize)>>,
    }

    impl CacheOps for RecordingCache {
        fn flush_range(&self, _addr: PhysAddr, _len: usize) {}

        fn flush_bytes(&self, bytes: &[u8]) {
            self.flushed.lock().push((bytes.as_ptr() as usize, bytes.len()));
        }

        fn zero_range(&self, _addr: PhysAddr, _len: usize) {}
    }

    #[derive(Default)]
    struct ScriptedWorld {
        reject_protect: AtomicBool,
        reject_unprotect: AtomicBool,
        protected: AtomicUsize,
    }

    impl TrustedWorld for ScriptedWorld {
        fn protect(&self, _desc: &ProtectionDescriptor) -> bool {
            if self.reject_protect.load(Ordering::SeqCst) {
                return false;
            }
            self.protected.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn unprotect(&self, _desc: &ProtectionDescriptor) -> bool {
            if self.reject_unprotect.load(Ordering::SeqCst) {
                return false;
            }
            self.protected.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    fn service(world: Arc<ScriptedWorld>) -> ProtectionService {
        let iova = IovaPool::new(0x4000_0000, 0x10_0000, 0x10_0000).unwrap();
        ProtectionService::new(iova, world, Arc::new(NoopCache))
    }

    #[test]
    fn single_chunk_is_inline() {
        let service = service(Arc::default());
        let desc = service
            .protect(3, &[Chunk::new(0x9000_0000, 0x2000)], 0x1000)
            .unwrap();
        let info = desc.info();
        assert_eq!(info.chunk_count, 1);
        assert_eq!(info.bus_address, 0x9000_0000);
        assert_eq!(info.flags, 3);
        assert_eq!(info.dma_addr, 0x4000_0000);
        assert_eq!(info.as_bytes().len(), 24);
    }

    #[test]
    fn flushes_the_records_the_trusted_world_reads() {
        let cache = Arc::new(RecordingCache::default());
        let iova = IovaPool::new(0x4000_0000, 0x10_0000, 0x10_0000).unwrap();
        let service =
            ProtectionService::new(iova, Arc::new(ScriptedWorld::default()), cache.clone());
        let chunks = [Chunk::new(0x1_0000, 0x1_0000), Chunk::new(0x3_0000, 0x1_0000)];
        let desc = service.protect(1, &chunks, 0x1_0000).unwrap();

        let info = desc.info();
        assert_eq!(
            *cache.flushed.lock(),
            [
                (info as *const BufferProtInfo as usize, size_of::<BufferProtInfo>()),
                (info.bus_address as usize, 2 * size_of::<u64>()),
            ]
        );
        assert_eq!(info.dma_addr, 0x4000_0000);
        assert_eq!(info.chunk_count, 2);
    }

    #[test]
    fn multi_chunk_requires_uniform_size() {
        let service = service(Arc::default());
        let chunks = [Chunk::new(0x1_0000, 0x1_0000), Chunk::new(0x3_0000, 0x2000)];
        assert_eq!(
            service.protect(1, &chunks, 0x1000).err(),
            Some(IonError::InvalidArg)
        );
        let chunks = [Chunk::new(0x1_0000, 0x1_0000), Chunk::new(0x3_0000, 0x1_0000)];
        let desc = service.protect(1, &chunks, 0x1_0000).unwrap();
        assert_eq!(desc.chunk_count(), 2);
        assert_eq!(desc.total_size(), 0x2_0000);
        assert_eq!(
            desc.phys_addrs(),
            [PhysAddr::from(0x1_0000), PhysAddr::from(0x3_0000)]
        );
    }

    #[test]
    fn rejection_releases_iova() {
        let world = Arc::new(ScriptedWorld::default());
        world.reject_protect.store(true, Ordering::SeqCst);
        let service = service(world);
        let before = service.iova_pool().free_bytes();
        assert_eq!(
            service.protect(1, &[Chunk::new(0, 0x1000)], 0x1000).err(),
            Some(IonError::ProtectionRejected)
        );
        assert_eq!(service.iova_pool().free_bytes(), before);
    }

    #[test]
    fn round_trip_reuses_iova() {
        let service = service(Arc::default());
        let desc = service.protect(1, &[Chunk::new(0, 0x4000)], 0x1000).unwrap();
        let iova = desc.iova();
        service.unprotect(&desc).unwrap();
        drop(desc);
        let again = service.protect(1, &[Chunk::new(0x8000, 0x4000)], 0x1000).unwrap();
        assert_eq!(again.iova(), iova);
    }

    #[test]
    fn failed_unprotect_leaks_iova() {
        let world = Arc::new(ScriptedWorld::default());
        let service = service(world.clone());
        let desc = service.protect(1, &[Chunk::new(0, 0x4000)], 0x1000).unwrap();
        let leaked = service.iova_pool().free_bytes();
        world.reject_unprotect.store(true, Ordering::SeqCst);
        assert_eq!(service.unprotect(&desc), Err(IonError::UnprotectFailed));
        assert_eq!(service.iova_pool().free_bytes(), leaked);
        assert_eq!(world.protected.load(Ordering::SeqCst), 1);

        // 下一次保护不会拿到仍被安全世界占用的地址
        world.reject_unprotect.store(false, Ordering::SeqCst);
        let other = service.protect(1, &[Chunk::new(0x8000, 0x4000)], 0x1000).unwrap();
        assert_ne!(other.iova(), desc.iova());
    }
}
