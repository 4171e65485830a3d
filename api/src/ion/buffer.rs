//! Ion 缓冲区及其管理

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use memory_addr::VirtAddr;
use slab::Slab;
use spin::{Mutex, MutexGuard};

use super::{
    error::{IonError, IonResult},
    protect::ProtectionDescriptor,
    types::{Chunk, HeapId, IonFlags, IonHandle, OwnerTask},
};

/// 内核虚拟映射状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    KernelMapped { vaddr: VirtAddr, count: usize },
}

/// 缓冲区生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLifecycle {
    /// 持有外部引用
    Live,
    /// 已释放，等待堆的延迟释放链表回收
    Deferred,
    /// 解除保护失败，物理内存被故意泄漏
    Leaked,
}

/// 由缓冲区状态锁保护的可变部分
#[derive(Debug)]
pub struct BufferState {
    pub map: MapState,
    pub protection: Option<ProtectionDescriptor>,
    pub lifecycle: BufferLifecycle,
}

/// Ion 缓冲区信息
#[derive(Debug)]
pub struct IonBuffer {
    /// 缓冲区句柄
    pub handle: IonHandle,
    /// 所属堆
    pub heap_id: HeapId,
    /// 缓冲区大小，等于所有物理块长度之和
    pub size: usize,
    /// 物理块
    pub chunks: Vec<Chunk>,
    /// 标志
    pub flags: IonFlags,
    /// 创建者
    pub owner: OwnerTask,
    /// 外部引用计数
    ref_count: AtomicUsize,
    state: Mutex<BufferState>,
}

impl IonBuffer {
    pub fn new(
        handle: IonHandle,
        heap_id: HeapId,
        chunks: Vec<Chunk>,
        flags: IonFlags,
        protection: Option<ProtectionDescriptor>,
    ) -> Self {
        Self {
            handle,
            heap_id,
            size: chunks.iter().map(|chunk| chunk.len).sum(),
            chunks,
            flags,
            owner: OwnerTask::current(),
            ref_count: AtomicUsize::new(1),
            state: Mutex::new(BufferState {
                map: MapState::Unmapped,
                protection,
                lifecycle: BufferLifecycle::Live,
            }),
        }
    }

    /// 增加引用计数；已经降到 0 的缓冲区不能再被引用，返回 `None`
    pub fn inc_ref(&self) -> Option<usize> {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count != 0).then(|| count + 1)
            })
            .ok()
            .map(|old| old + 1)
    }

    /// 减少引用计数；已经为 0 时返回 `None`
    pub fn dec_ref(&self) -> Option<usize> {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|old| old - 1)
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
    }

    pub fn lifecycle(&self) -> BufferLifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_protected(&self) -> bool {
        self.state.lock().protection.is_some()
    }
}

/// Ion 缓冲区管理器
///
/// 以 ID 为下标保存所有尚未真正归还物理内存的缓冲区，ID 在缓冲区销毁后回收。
pub struct IonBufferManager {
    buffers: Mutex<Slab<Arc<IonBuffer>>>,
}

impl IonBufferManager {
    pub const fn new() -> Self {
        Self {
            buffers: Mutex::new(Slab::new()),
        }
    }

    /// 分配 ID 并注册由 `build` 构造的缓冲区
    pub fn register_with(
        &self,
        build: impl FnOnce(IonHandle) -> IonBuffer,
    ) -> IonResult<Arc<IonBuffer>> {
        let mut buffers = self.buffers.lock();
        let entry = buffers.vacant_entry();
        let handle = u32::try_from(entry.key())
            .map(IonHandle)
            .map_err(|_| IonError::NoMemory)?;
        let buffer = Arc::new(build(handle));
        entry.insert(buffer.clone());
        debug!("Registered Ion buffer with handle: {:?}", handle);
        Ok(buffer)
    }

    /// 取消注册缓冲区
    pub fn unregister_buffer(&self, handle: IonHandle) -> IonResult<Arc<IonBuffer>> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .try_remove(handle.0 as usize)
            .ok_or(IonError::InvalidArg)?;
        debug!("Unregistered Ion buffer with handle: {:?}", handle);
        Ok(buffer)
    }

    /// 获取缓冲区
    pub fn get_buffer(&self, handle: IonHandle) -> IonResult<Arc<IonBuffer>> {
        let buffers = self.buffers.lock();
        buffers
            .get(handle.0 as usize)
            .cloned()
            .ok_or(IonError::InvalidArg)
    }

    /// 获取缓冲区数量
    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// 按 ID 顺序列出满足条件的缓冲区
    pub fn collect(&self, mut filter: impl FnMut(&IonBuffer) -> bool) -> Vec<Arc<IonBuffer>> {
        self.buffers
            .lock()
            .iter()
            .filter(|(_, buffer)| filter(buffer))
            .map(|(_, buffer)| buffer.clone())
            .collect()
    }
}

impl Default for IonBufferManager {
    fn default() -> Self {
        Self::new()
    }
}
