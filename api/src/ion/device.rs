//! Ion 设备实现
//!
//! 把堆注册表、缓冲区管理器、保护服务和事件日志组合成一个分配器上下文。
//! 所有组件都由 `IonDevice` 持有，没有全局单例。

use alloc::{boxed::Box, format, sync::Arc, vec::Vec};
use core::mem;
use std::time::Instant;

use memory_addr::{PhysAddrRange, VirtAddr};

use super::{
    buffer::{BufferLifecycle, IonBuffer, IonBufferManager, MapState},
    daemon::ReclaimDaemon,
    error::{IonError, IonResult},
    event::{EventLog, IonEventType},
    heap::HeapBackend,
    iova::IovaPool,
    platform::Platform,
    protect::{ProtectionDescriptor, ProtectionService},
    registry::{HeapAllocation, HeapHandle, HeapRegistry, IonHeap},
    types::{Chunk, HeapFlags, HeapId, HeapInfo, IonFlags, IonHandle},
};
use crate::file::ion::BufferHandle;

/// 设备级配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IonConfig {
    /// 安全 IOVA 窗口起始地址
    pub iova_base: usize,
    /// 安全 IOVA 窗口大小
    pub iova_size: usize,
    /// IOVA 最大对齐，超过的请求会被截断
    pub iova_max_align: usize,
    /// 事件日志容量
    pub event_log_capacity: usize,
    /// 为支持延迟释放的堆启动后台释放线程
    pub deferred_free_worker: bool,
}

impl Default for IonConfig {
    fn default() -> Self {
        Self {
            iova_base: 0x4000_0000,
            iova_size: 0x4000_0000,
            iova_max_align: 0x10_0000,
            event_log_capacity: 1024,
            deferred_free_worker: true,
        }
    }
}

/// 销毁缓冲区用到的组件，与延迟释放线程共享
struct DeviceCore {
    /// 缓冲区管理器
    buffers: IonBufferManager,
    /// 保护服务，独占 IOVA 池
    protection: ProtectionService,
    events: EventLog,
    platform: Platform,
}

/// Ion 设备
pub struct IonDevice {
    /// 堆注册表
    registry: HeapRegistry,
    core: Arc<DeviceCore>,
    deferred_free_worker: bool,
}

impl IonDevice {
    /// 创建 Ion 设备
    pub fn new(config: IonConfig, platform: Platform) -> IonResult<Arc<Self>> {
        if config.event_log_capacity == 0 {
            return Err(IonError::InvalidArg);
        }
        let iova = IovaPool::new(config.iova_base, config.iova_size, config.iova_max_align)?;
        info!(
            "Initializing Ion device: iova={:#x}+{:#x}",
            config.iova_base, config.iova_size
        );
        Ok(Arc::new(Self {
            registry: HeapRegistry::new(),
            core: Arc::new(DeviceCore {
                buffers: IonBufferManager::new(),
                protection: ProtectionService::new(
                    iova,
                    platform.trusted.clone(),
                    platform.cache.clone(),
                ),
                events: EventLog::new(config.event_log_capacity),
                platform,
            }),
            deferred_free_worker: config.deferred_free_worker,
        }))
    }

    /// 注册一个堆，越晚注册的堆优先级越高
    ///
    /// 支持延迟释放的堆会得到一个 `<name>_deferred` 线程，缓冲区挂入延迟链表时
    /// 被唤醒并清空链表。
    pub fn register_heap(&self, heap: impl HeapBackend) -> IonResult<HeapId> {
        let id = self.registry.register(Box::new(heap))?;
        let Some(heap) = self.registry.get(id) else {
            return Err(IonError::InvalidArg);
        };
        if self.deferred_free_worker && heap.flags().contains(HeapFlags::DEFER_FREE) {
            let worker = ReclaimDaemon::spawn(&format!("{}_deferred", heap.name()), {
                let heap = Arc::downgrade(&heap);
                let core = self.core.clone();
                move || {
                    if let Some(heap) = heap.upgrade() {
                        core.drain(&heap, usize::MAX);
                    }
                }
            });
            match worker {
                Ok(worker) => heap.start_deferred_worker(worker),
                Err(err) => warn!("{}: no deferred free worker: {}", heap.name(), err),
            }
        }
        Ok(id)
    }

    /// 受保护分配的堆重定向规则
    pub fn add_remap(&self, logical: HeapId, protected: bool, target: HeapId) -> IonResult<()> {
        self.registry.add_remap(logical, protected, target)
    }

    /// 分配缓冲区，返回持有一个外部引用的句柄
    pub fn allocate(
        self: &Arc<Self>,
        len: usize,
        heap_mask: u32,
        flags: IonFlags,
    ) -> IonResult<BufferHandle> {
        let buffer = self.alloc_buffer(len, heap_mask, flags)?;
        Ok(BufferHandle::new(self.clone(), &buffer))
    }

    /// 分配缓冲区，返回裸缓冲区 ID；调用者负责最终调用 [`IonDevice::release`]
    pub fn alloc(&self, len: usize, heap_mask: u32, flags: IonFlags) -> IonResult<IonHandle> {
        self.alloc_buffer(len, heap_mask, flags)
            .map(|buffer| buffer.handle)
    }

    fn alloc_buffer(&self, len: usize, heap_mask: u32, flags: IonFlags) -> IonResult<Arc<IonBuffer>> {
        debug!(
            "Alloc request: len={:#x}, heap_mask={:#x}, flags={:?}",
            len, heap_mask, flags
        );
        let begin = Instant::now();
        let HeapAllocation {
            heap,
            mut chunks,
            mut protection,
        } = self.registry.allocate(len, heap_mask, flags, &self.core.protection, |heap| {
            self.core.drain(heap, usize::MAX)
        })?;
        let protected = protection.is_some();

        let registered = self.core.buffers.register_with(|handle| {
            IonBuffer::new(
                handle,
                heap.id(),
                mem::take(&mut chunks),
                flags,
                protection.take(),
            )
        });
        let buffer = match registered {
            Ok(buffer) => buffer,
            Err(err) => {
                self.rollback(&heap, &chunks, protection);
                return Err(err);
            }
        };

        heap.account_alloc(buffer.size);
        self.core
            .events
            .record(heap.name(), IonEventType::Alloc, buffer.handle, buffer.size, begin);
        if protected {
            self.core
                .events
                .record(heap.name(), IonEventType::Protect, buffer.handle, buffer.size, begin);
        }
        debug!(
            "Allocated Ion buffer: handle={}, heap={}, size={:#x}, chunks={}",
            buffer.handle.as_u32(),
            heap.name(),
            buffer.size,
            buffer.chunks.len()
        );
        Ok(buffer)
    }

    /// 缓冲区没能登记时归还已经拿到的内存
    fn rollback(&self, heap: &IonHeap, chunks: &[Chunk], protection: Option<ProtectionDescriptor>) {
        if let Some(desc) = protection {
            if self.core.protection.unprotect(&desc).is_err() {
                return;
            }
        }
        heap.backend().free(chunks);
    }

    /// 增加一个外部引用
    pub fn dup(&self, handle: IonHandle) -> IonResult<usize> {
        self.live_buffer(handle)?
            .inc_ref()
            .ok_or(IonError::InvalidArg)
    }

    /// 释放一个外部引用
    ///
    /// 最后一个引用释放时，支持延迟释放的堆把缓冲区挂到延迟链表上，其余的堆
    /// 立即销毁缓冲区。缓冲区在物理内存真正归还之前一直可以在注册表中看到。
    pub fn release(&self, handle: IonHandle) -> IonResult<()> {
        let buffer = self.core.buffers.get_buffer(handle)?;
        match buffer.dec_ref() {
            None => {
                warn!("Release of unreferenced Ion buffer: handle={}", handle.as_u32());
                Err(IonError::InvalidArg)
            }
            Some(0) => {
                let heap = self.heap_of(&buffer)?;
                if heap.flags().contains(HeapFlags::DEFER_FREE) {
                    buffer.state().lifecycle = BufferLifecycle::Deferred;
                    debug!(
                        "Deferred Ion buffer: handle={}, heap={}",
                        handle.as_u32(),
                        heap.name()
                    );
                    heap.push_deferred(buffer);
                    Ok(())
                } else {
                    self.core.destroy(&heap, buffer).map(|_| ())
                }
            }
            Some(_) => Ok(()),
        }
    }

    /// 从指定堆的延迟链表中按从旧到新的顺序销毁缓冲区，直到回收 `target`
    /// 字节或链表为空，返回实际回收的字节数
    pub fn drain_deferred(&self, heap_id: HeapId, target: usize) -> IonResult<usize> {
        let heap = self.registry.get(heap_id).ok_or(IonError::InvalidArg)?;
        Ok(self.core.drain(&heap, target))
    }

    /// 低内存通知：先清空各堆的延迟链表，剩余的目标交给堆自身的收缩逻辑
    pub fn reclaim(&self, target: usize) -> usize {
        let heaps = self.registry.heaps();
        let mut reclaimed = 0;
        for heap in &heaps {
            if reclaimed >= target {
                break;
            }
            reclaimed += self.core.drain(heap, target - reclaimed);
        }
        for heap in &heaps {
            if reclaimed >= target {
                break;
            }
            reclaimed += heap.backend().shrink(target - reclaimed);
        }
        debug!("Reclaimed {:#x} of {:#x} bytes", reclaimed, target);
        reclaimed
    }

    /// 映射到内核虚拟地址，重复映射只增加计数
    pub fn map_kernel(&self, handle: IonHandle) -> IonResult<VirtAddr> {
        let begin = Instant::now();
        let buffer = self.live_buffer(handle)?;
        let heap = self.heap_of(&buffer)?;
        check_cpu_access(&heap, &buffer)?;

        let vaddr = {
            let mut state = buffer.state();
            match state.map {
                MapState::KernelMapped { vaddr, count } => {
                    state.map = MapState::KernelMapped {
                        vaddr,
                        count: count + 1,
                    };
                    vaddr
                }
                MapState::Unmapped => {
                    let vaddr = heap.backend().map_kernel(
                        &buffer.chunks,
                        self.core.platform.mapper.as_ref(),
                    )?;
                    state.map = MapState::KernelMapped { vaddr, count: 1 };
                    vaddr
                }
            }
        };
        self.core
            .events
            .record(heap.name(), IonEventType::Kmap, handle, buffer.size, begin);
        Ok(vaddr)
    }

    /// 撤销一次内核映射，计数归零时真正解除映射
    pub fn unmap_kernel(&self, handle: IonHandle) -> IonResult<()> {
        let buffer = self.live_buffer(handle)?;
        let heap = self.heap_of(&buffer)?;
        let mut state = buffer.state();
        match state.map {
            MapState::Unmapped => Err(IonError::InvalidArg),
            MapState::KernelMapped { vaddr, count: 1 } => {
                heap.backend().unmap_kernel(
                    vaddr,
                    &buffer.chunks,
                    self.core.platform.mapper.as_ref(),
                );
                state.map = MapState::Unmapped;
                Ok(())
            }
            MapState::KernelMapped { vaddr, count } => {
                state.map = MapState::KernelMapped {
                    vaddr,
                    count: count - 1,
                };
                Ok(())
            }
        }
    }

    /// 用户态映射：返回缓冲区的物理地址区间
    pub fn mmap(&self, handle: IonHandle) -> IonResult<Vec<PhysAddrRange>> {
        let begin = Instant::now();
        let buffer = self.live_buffer(handle)?;
        let heap = self.heap_of(&buffer)?;
        check_cpu_access(&heap, &buffer)?;
        let ranges = buffer.chunks.iter().map(Chunk::range).collect();
        self.core
            .events
            .record(heap.name(), IonEventType::Mmap, handle, buffer.size, begin);
        Ok(ranges)
    }

    /// 把 CPU 写入的数据刷给设备；非 cached 缓冲区只在 `SYNC_FORCE` 时刷新
    pub fn sync_for_device(&self, handle: IonHandle) -> IonResult<()> {
        let buffer = self.live_buffer(handle)?;
        if buffer.flags.intersects(IonFlags::CACHED | IonFlags::SYNC_FORCE) {
            for chunk in &buffer.chunks {
                self.core.platform.cache.flush_range(chunk.addr, chunk.len);
            }
        }
        Ok(())
    }

    /// 按名字查找堆
    pub fn query(&self, name: &str) -> Option<HeapHandle> {
        self.registry.query(name)
    }

    /// 列出所有堆
    pub fn query_heaps(&self) -> Vec<HeapInfo> {
        self.registry.query_heaps()
    }

    pub fn heap(&self, id: HeapId) -> Option<Arc<IonHeap>> {
        self.registry.get(id)
    }

    /// 获取缓冲区，包括延迟释放中和已泄漏的缓冲区
    pub fn buffer(&self, handle: IonHandle) -> IonResult<Arc<IonBuffer>> {
        self.core.buffers.get_buffer(handle)
    }

    pub fn buffer_count(&self) -> usize {
        self.core.buffers.buffer_count()
    }

    pub fn events(&self) -> &EventLog {
        &self.core.events
    }

    pub fn protection(&self) -> &ProtectionService {
        &self.core.protection
    }

    pub(crate) fn buffers(&self) -> &IonBufferManager {
        &self.core.buffers
    }

    fn live_buffer(&self, handle: IonHandle) -> IonResult<Arc<IonBuffer>> {
        let buffer = self.core.buffers.get_buffer(handle)?;
        if buffer.lifecycle() != BufferLifecycle::Live {
            return Err(IonError::InvalidArg);
        }
        Ok(buffer)
    }

    fn heap_of(&self, buffer: &IonBuffer) -> IonResult<Arc<IonHeap>> {
        self.registry.get(buffer.heap_id).ok_or(IonError::InvalidArg)
    }
}

impl DeviceCore {
    /// 销毁缓冲区并把物理内存还给堆，返回归还的字节数
    fn destroy(&self, heap: &IonHeap, buffer: Arc<IonBuffer>) -> IonResult<usize> {
        let begin = Instant::now();
        let (mapping, protection) = {
            let mut state = buffer.state();
            let mapping = match mem::replace(&mut state.map, MapState::Unmapped) {
                MapState::KernelMapped { vaddr, .. } => Some(vaddr),
                MapState::Unmapped => None,
            };
            (mapping, state.protection.take())
        };

        if let Some(vaddr) = mapping {
            heap.backend()
                .unmap_kernel(vaddr, &buffer.chunks, self.platform.mapper.as_ref());
        }

        if let Some(desc) = protection {
            let unprotect_begin = Instant::now();
            if let Err(err) = self.protection.unprotect(&desc) {
                error!(
                    "Leaking Ion buffer: handle={}, heap={}, size={:#x}",
                    buffer.handle.as_u32(),
                    heap.name(),
                    buffer.size
                );
                let mut state = buffer.state();
                state.protection = Some(desc);
                state.lifecycle = BufferLifecycle::Leaked;
                return Err(err);
            }
            self.events.record(
                heap.name(),
                IonEventType::Unprotect,
                buffer.handle,
                buffer.size,
                unprotect_begin,
            );
        }

        if !buffer.flags.contains(IonFlags::NOZEROED)
            && !heap.flags().contains(HeapFlags::UNTOUCHABLE)
        {
            for chunk in &buffer.chunks {
                self.platform.cache.zero_range(chunk.addr, chunk.len);
                self.platform.cache.flush_range(chunk.addr, chunk.len);
            }
        }

        heap.backend().free(&buffer.chunks);
        heap.account_free(buffer.size);
        self.buffers.unregister_buffer(buffer.handle)?;
        self.events
            .record(heap.name(), IonEventType::Free, buffer.handle, buffer.size, begin);
        debug!(
            "Freed Ion buffer: handle={}, heap={}, size={:#x}",
            buffer.handle.as_u32(),
            heap.name(),
            buffer.size
        );
        Ok(buffer.size)
    }

    fn drain(&self, heap: &IonHeap, target: usize) -> usize {
        let mut reclaimed = 0;
        while reclaimed < target {
            // 每次只在弹出时持有链表锁
            let Some(buffer) = heap.pop_deferred() else {
                break;
            };
            match self.destroy(heap, buffer) {
                Ok(size) => reclaimed += size,
                Err(err) => warn!("{}: deferred free failed: {}", heap.name(), err),
            }
        }
        reclaimed
    }
}

/// CPU 不能访问受保护的缓冲区和不可触碰的堆
fn check_cpu_access(heap: &IonHeap, buffer: &IonBuffer) -> IonResult<()> {
    if buffer.is_protected() || heap.flags().contains(HeapFlags::UNTOUCHABLE) {
        return Err(IonError::PermissionDenied);
    }
    Ok(())
}

impl Drop for IonDevice {
    fn drop(&mut self) {
        let heaps = self.registry.heaps();
        for heap in &heaps {
            heap.stop_deferred_worker();
        }
        for heap in &heaps {
            self.core.drain(heap, usize::MAX);
        }
        let remaining = self.core.buffers.buffer_count();
        if remaining != 0 {
            warn!("Ion device dropped with {} buffer(s) outstanding", remaining);
        }
        info!("Ion device shut down");
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::ion::{
        heap::{
            CarveoutConfig, CarveoutHeap, HPA_CHUNK_SIZE, HpaConfig, HpaHeap,
            page::BuddyPageAllocator,
        },
        platform::TrustedWorld,
        types::PAGE_SIZE,
    };

    #[derive(Default)]
    struct SwitchableWorld {
        reject_unprotect: AtomicBool,
    }

    impl TrustedWorld for SwitchableWorld {
        fn protect(&self, _desc: &ProtectionDescriptor) -> bool {
            true
        }

        fn unprotect(&self, _desc: &ProtectionDescriptor) -> bool {
            !self.reject_unprotect.load(Ordering::SeqCst)
        }
    }

    fn device() -> Arc<IonDevice> {
        IonDevice::new(IonConfig::default(), Platform::default()).unwrap()
    }

    /// 延迟链表只由调用者清空
    fn manual_device() -> Arc<IonDevice> {
        let config = IonConfig {
            deferred_free_worker: false,
            ..IonConfig::default()
        };
        IonDevice::new(config, Platform::default()).unwrap()
    }

    fn hpa(chunks: usize) -> HpaHeap {
        let pages = Arc::new(BuddyPageAllocator::new(0x9000_0000, chunks * HPA_CHUNK_SIZE));
        HpaHeap::new(HpaConfig::new("hpa"), pages)
    }

    fn carveout(name: &str, pages: usize) -> CarveoutHeap {
        CarveoutHeap::new(CarveoutConfig::new(name, 0x8000_0000, pages * PAGE_SIZE)).unwrap()
    }

    #[test]
    fn release_destroys_immediately_without_deferred_free() {
        let device = device();
        let id = device.register_heap(carveout("carveout", 4)).unwrap();
        let handle = device.alloc(PAGE_SIZE, id.mask(), IonFlags::empty()).unwrap();
        assert_eq!(device.heap(id).unwrap().stats().current(), PAGE_SIZE);

        assert_eq!(device.dup(handle), Ok(2));
        device.release(handle).unwrap();
        assert_eq!(device.buffer_count(), 1);
        device.release(handle).unwrap();
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(device.heap(id).unwrap().stats().current(), 0);
        assert_eq!(device.release(handle), Err(IonError::InvalidArg));
    }

    #[test]
    fn deferred_buffers_stay_visible_until_drained() {
        let device = manual_device();
        let id = device.register_heap(hpa(64)).unwrap();
        let a = device.alloc(0x20_0000, id.mask(), IonFlags::empty()).unwrap();
        let b = device.alloc(0x10_0000, id.mask(), IonFlags::empty()).unwrap();
        device.release(a).unwrap();
        device.release(b).unwrap();

        assert_eq!(device.buffer_count(), 2);
        assert_eq!(device.buffer(a).unwrap().lifecycle(), BufferLifecycle::Deferred);
        assert_eq!(device.release(a), Err(IonError::InvalidArg));
        assert_eq!(device.map_kernel(a), Err(IonError::InvalidArg));

        // 最旧的先回收
        assert_eq!(device.drain_deferred(id, 1), Ok(0x20_0000));
        assert!(device.buffer(a).is_err());
        assert!(device.buffer(b).is_ok());
        assert_eq!(device.reclaim(usize::MAX), 0x10_0000);
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(device.heap(id).unwrap().stats().current(), 0);
    }

    #[test]
    fn full_heap_drains_deferred_buffers_before_failing() {
        let device = manual_device();
        let id = device.register_heap(hpa(4)).unwrap();
        let heap = device.heap(id).unwrap();
        for round in 0..10 {
            let handle = device
                .alloc(HPA_CHUNK_SIZE, id.mask(), IonFlags::empty())
                .unwrap_or_else(|err| panic!("alloc #{round}: {err:?}"));
            device.release(handle).unwrap();
            assert!(heap.deferred_usage().0 <= 4);
        }
        // 第 4 和第 8 次分配各清空过一次链表
        assert_eq!(heap.deferred_usage(), (2, 2 * HPA_CHUNK_SIZE));
        assert_eq!(device.reclaim(usize::MAX), 2 * HPA_CHUNK_SIZE);
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(heap.stats().current(), 0);
    }

    #[test]
    fn deferred_worker_frees_released_buffers() {
        let device = device();
        let id = device.register_heap(hpa(4)).unwrap();
        let heap = device.heap(id).unwrap();
        for round in 0..16 {
            let handle = device
                .alloc(2 * HPA_CHUNK_SIZE, id.mask(), IonFlags::empty())
                .unwrap_or_else(|err| panic!("alloc #{round}: {err:?}"));
            device.release(handle).unwrap();
        }
        heap.wait_deferred_idle();
        assert_eq!(heap.deferred_usage(), (0, 0));
        assert_eq!(heap.stats().current(), 0);
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(heap.stats().total_allocated(), 32 * HPA_CHUNK_SIZE);
    }

    #[test]
    fn kernel_mapping_is_refcounted() {
        let device = device();
        let id = device.register_heap(carveout("carveout", 4)).unwrap();
        let handle = device.alloc(PAGE_SIZE, id.mask(), IonFlags::CACHED).unwrap();

        let first = device.map_kernel(handle).unwrap();
        assert_eq!(device.map_kernel(handle), Ok(first));
        device.unmap_kernel(handle).unwrap();
        assert!(matches!(
            device.buffer(handle).unwrap().state().map,
            MapState::KernelMapped { count: 1, .. }
        ));
        device.unmap_kernel(handle).unwrap();
        assert_eq!(device.unmap_kernel(handle), Err(IonError::InvalidArg));

        let kmaps = device
            .events()
            .snapshot()
            .iter()
            .filter(|event| event.event_type == IonEventType::Kmap)
            .count();
        assert_eq!(kmaps, 2);
        device.sync_for_device(handle).unwrap();
        device.release(handle).unwrap();
    }

    #[test]
    fn protected_buffers_reject_cpu_access() {
        let device = device();
        let mut config = CarveoutConfig::new("secure", 0x8000_0000, 4 * PAGE_SIZE);
        config.secure = true;
        let id = device.register_heap(CarveoutHeap::new(config).unwrap()).unwrap();
        let handle = device.alloc(PAGE_SIZE, id.mask(), IonFlags::PROTECTED).unwrap();

        assert!(device.buffer(handle).unwrap().is_protected());
        assert_eq!(device.map_kernel(handle), Err(IonError::PermissionDenied));
        assert_eq!(device.mmap(handle).err(), Some(IonError::PermissionDenied));
        device.release(handle).unwrap();
        assert_eq!(
            device.protection().iova_pool().free_bytes(),
            IonConfig::default().iova_size
        );
    }

    #[test]
    fn unprotect_failure_leaks_the_buffer() {
        let world = Arc::new(SwitchableWorld::default());
        let device = IonDevice::new(IonConfig::default(), Platform::with_trusted(world.clone()))
            .unwrap();
        let mut config = CarveoutConfig::new("secure", 0x8000_0000, 4 * PAGE_SIZE);
        config.secure = true;
        let id = device.register_heap(CarveoutHeap::new(config).unwrap()).unwrap();
        let handle = device.alloc(PAGE_SIZE, id.mask(), IonFlags::PROTECTED).unwrap();

        world.reject_unprotect.store(true, Ordering::SeqCst);
        assert_eq!(device.release(handle), Err(IonError::UnprotectFailed));
        let buffer = device.buffer(handle).unwrap();
        assert_eq!(buffer.lifecycle(), BufferLifecycle::Leaked);
        assert!(buffer.is_protected());
        assert_eq!(device.heap(id).unwrap().stats().current(), PAGE_SIZE);
        assert!(device.protection().iova_pool().free_bytes() < IonConfig::default().iova_size);
    }

    #[test]
    fn zero_capacity_event_log_is_rejected() {
        let config = IonConfig {
            event_log_capacity: 0,
            ..IonConfig::default()
        };
        assert!(IonDevice::new(config, Platform::default()).is_err());
    }

    #[test]
    fn iova_window_must_fit_32_bits() {
        let config = IonConfig {
            iova_base: 0x1_0000_0000,
            ..IonConfig::default()
        };
        assert_eq!(
            IonDevice::new(config, Platform::default()).err(),
            Some(IonError::InvalidArg)
        );
        let config = IonConfig {
            iova_base: 0xc000_0000,
            iova_size: 0x4000_0000,
            ..IonConfig::default()
        };
        assert!(IonDevice::new(config, Platform::default()).is_ok());
    }
}
