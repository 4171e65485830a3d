//! Ion 堆注册表
//!
//! 按优先级保存所有堆（越晚注册越先尝试），并把一次分配请求分发到堆掩码
//! 选中的堆上。注册只在启动时发生，运行时的分配只取读锁。

use alloc::{boxed::Box, collections::VecDeque, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use memory_addr::align_up_4k;
use spin::{Mutex, RwLock};

use super::{
    buffer::IonBuffer,
    daemon::ReclaimDaemon,
    error::{IonError, IonResult},
    heap::HeapBackend,
    protect::{ProtectionDescriptor, ProtectionService},
    types::{Chunk, HeapFlags, HeapId, HeapInfo, IonFlags, MAX_HEAPS},
};

/// 分配统计
#[derive(Debug, Default)]
pub struct HeapStats {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl HeapStats {
    fn add(&self, size: usize) {
        let current = self.current.fetch_add(size, Ordering::SeqCst) + size;
        self.peak.fetch_max(current, Ordering::SeqCst);
        self.total.fetch_add(size, Ordering::SeqCst);
    }

    fn sub(&self, size: usize) {
        self.current.fetch_sub(size, Ordering::SeqCst);
    }

    /// 当前仍占用物理内存的字节数（包括延迟释放中的缓冲区）
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// 历史峰值，只增不减
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// 累计分配的字节数
    pub fn total_allocated(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// 注册表中的一个堆
pub struct IonHeap {
    id: HeapId,
    backend: Box<dyn HeapBackend>,
    stats: HeapStats,
    /// 延迟释放链表，只在拼接时持锁
    deferred: Mutex<VecDeque<Arc<IonBuffer>>>,
    /// 延迟释放线程，缓冲区挂入链表时唤醒
    deferred_worker: Mutex<Option<ReclaimDaemon>>,
}

impl IonHeap {
    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn flags(&self) -> HeapFlags {
        self.backend.flags()
    }

    pub fn backend(&self) -> &dyn HeapBackend {
        self.backend.as_ref()
    }

    /// 取回具体的堆类型
    pub fn backend_as<T: HeapBackend>(&self) -> Option<&T> {
        self.backend.downcast_ref::<T>()
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    pub fn info(&self) -> HeapInfo {
        HeapInfo {
            name: self.backend.name().into(),
            heap_type: self.backend.heap_type(),
            id: self.id,
            size: self.backend.size(),
            flags: self.backend.flags(),
        }
    }

    pub(crate) fn account_alloc(&self, size: usize) {
        self.stats.add(size);
    }

    pub(crate) fn account_free(&self, size: usize) {
        self.stats.sub(size);
    }

    pub(crate) fn push_deferred(&self, buffer: Arc<IonBuffer>) {
        self.deferred.lock().push_back(buffer);
        if let Some(worker) = self.deferred_worker.lock().as_ref() {
            worker.wake();
        }
    }

    pub(crate) fn start_deferred_worker(&self, worker: ReclaimDaemon) {
        *self.deferred_worker.lock() = Some(worker);
    }

    /// 停止延迟释放线程并等待它退出
    pub(crate) fn stop_deferred_worker(&self) {
        let worker = self.deferred_worker.lock().take();
        drop(worker);
    }

    /// 等待延迟释放线程处理完已经挂入的缓冲区
    pub fn wait_deferred_idle(&self) {
        if let Some(worker) = self.deferred_worker.lock().as_ref() {
            worker.wait_idle();
        }
    }

    /// 取出最旧的延迟释放缓冲区
    pub(crate) fn pop_deferred(&self) -> Option<Arc<IonBuffer>> {
        self.deferred.lock().pop_front()
    }

    /// 延迟释放链表中的缓冲区数量和字节数
    pub fn deferred_usage(&self) -> (usize, usize) {
        let deferred = self.deferred.lock();
        (deferred.len(), deferred.iter().map(|buffer| buffer.size).sum())
    }
}

/// 堆查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapHandle {
    pub id: HeapId,
    pub flags: HeapFlags,
}

impl HeapHandle {
    pub fn mask(&self) -> u32 {
        self.id.mask()
    }
}

/// 受保护分配时的堆重定向规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRemap {
    pub logical: HeapId,
    pub protected: bool,
    pub target: HeapId,
}

/// 一次成功的堆分配
pub struct HeapAllocation {
    pub heap: Arc<IonHeap>,
    pub chunks: Vec<Chunk>,
    pub protection: Option<ProtectionDescriptor>,
}

#[derive(Default)]
struct RegistryInner {
    /// 按优先级排序，越晚注册越靠前
    heaps: Vec<Arc<IonHeap>>,
    by_name: HashMap<String, HeapId>,
    remaps: Vec<HeapRemap>,
}

/// Ion 堆注册表
#[derive(Default)]
pub struct HeapRegistry {
    inner: RwLock<RegistryInner>,
}

impl HeapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个堆，返回分配到的堆 ID
    pub fn register(&self, backend: Box<dyn HeapBackend>) -> IonResult<HeapId> {
        let mut inner = self.inner.write();
        if inner.heaps.len() >= MAX_HEAPS || inner.by_name.contains_key(backend.name()) {
            return Err(IonError::InvalidArg);
        }
        let id = HeapId(inner.heaps.len() as u32);
        info!(
            "Registered Ion heap {}: id={}, type={}, size={:#x}, flags={:?}",
            backend.name(),
            id.0,
            backend.heap_type().as_str(),
            backend.size(),
            backend.flags()
        );
        inner.by_name.insert(backend.name().into(), id);
        inner.heaps.insert(
            0,
            Arc::new(IonHeap {
                id,
                backend,
                stats: HeapStats::default(),
                deferred: Mutex::new(VecDeque::new()),
                deferred_worker: Mutex::new(None),
            }),
        );
        Ok(id)
    }

    /// 添加一条重定向规则：请求 `logical` 且保护状态为 `protected` 时改用 `target`
    pub fn add_remap(&self, logical: HeapId, protected: bool, target: HeapId) -> IonResult<()> {
        let mut inner = self.inner.write();
        if !inner.heaps.iter().any(|heap| heap.id == target) {
            return Err(IonError::InvalidArg);
        }
        inner.remaps.retain(|rule| !(rule.logical == logical && rule.protected == protected));
        inner.remaps.push(HeapRemap {
            logical,
            protected,
            target,
        });
        Ok(())
    }

    /// 按名字查找
    pub fn query(&self, name: &str) -> Option<HeapHandle> {
        let inner = self.inner.read();
        let id = *inner.by_name.get(name)?;
        let heap = inner.heaps.iter().find(|heap| heap.id == id)?;
        Some(HeapHandle {
            id,
            flags: heap.flags(),
        })
    }

    /// 按 ID 顺序列出所有堆
    pub fn query_heaps(&self) -> Vec<HeapInfo> {
        let mut heaps: Vec<_> = self.inner.read().heaps.iter().map(|heap| heap.info()).collect();
        heaps.sort_unstable_by_key(|info| info.id);
        heaps
    }

    pub fn get(&self, id: HeapId) -> Option<Arc<IonHeap>> {
        self.inner.read().heaps.iter().find(|heap| heap.id == id).cloned()
    }

    /// 按优先级排列的所有堆
    pub fn heaps(&self) -> Vec<Arc<IonHeap>> {
        self.inner.read().heaps.clone()
    }

    /// 应用重定向规则并按优先级取出掩码选中的堆
    fn candidates(&self, heap_mask: u32, protected: bool) -> Vec<Arc<IonHeap>> {
        let inner = self.inner.read();
        let mut mask = heap_mask;
        for rule in inner.remaps.iter().filter(|rule| rule.protected == protected) {
            if heap_mask & rule.logical.mask() != 0 {
                mask = (mask & !rule.logical.mask()) | rule.target.mask();
            }
        }
        inner
            .heaps
            .iter()
            .filter(|heap| mask & heap.id.mask() != 0)
            .cloned()
            .collect()
    }

    /// 按优先级在选中的堆上分配
    ///
    /// 堆分配失败且延迟链表非空时，先用 `drain` 清空该堆的延迟链表再重试一次，
    /// 仍然失败才尝试下一个堆。受保护请求只在安全堆上做保护，其余的堆照常
    /// 分配；保护失败时把内存还给堆并让整个请求失败。
    pub fn allocate(
        &self,
        len: usize,
        heap_mask: u32,
        flags: IonFlags,
        protection: &ProtectionService,
        drain: impl Fn(&IonHeap) -> usize,
    ) -> IonResult<HeapAllocation> {
        if len == 0 || len > isize::MAX as usize {
            return Err(IonError::InvalidArg);
        }
        let size = align_up_4k(len);
        let protected = flags.contains(IonFlags::PROTECTED);

        let candidates = self.candidates(heap_mask, protected);
        if candidates.is_empty() {
            debug!("No registered heap in mask: {:#x}", heap_mask);
            return Err(IonError::InvalidArg);
        }

        let mut attempted = false;
        for heap in candidates {
            let heap_flags = heap.flags();
            if heap_flags.contains(HeapFlags::UNTOUCHABLE) && !protected {
                warn!("{}: untouchable heap requires protection", heap.name());
                return Err(IonError::PermissionDenied);
            }

            attempted = true;
            let chunks = match heap.backend.allocate(size, flags) {
                Ok(chunks) => chunks,
                Err(err) if heap.deferred_usage().0 != 0 => {
                    let drained = drain(heap.as_ref());
                    debug!(
                        "{}: allocation of {:#x} failed ({}), drained {:#x} deferred bytes",
                        heap.name(),
                        size,
                        err,
                        drained
                    );
                    match heap.backend.allocate(size, flags) {
                        Ok(chunks) => chunks,
                        Err(_) => continue,
                    }
                }
                Err(err) => {
                    debug!("{}: allocation of {:#x} failed: {}", heap.name(), size, err);
                    continue;
                }
            };

            let protection = if protected && heap_flags.contains(HeapFlags::SECURE) {
                match protection.protect(
                    heap.backend.protection_id(),
                    &chunks,
                    heap.backend.protection_align(),
                ) {
                    Ok(desc) => Some(desc),
                    Err(err) => {
                        heap.backend.free(&chunks);
                        return Err(err);
                    }
                }
            } else {
                None
            };

            return Ok(HeapAllocation {
                heap,
                chunks,
                protection,
            });
        }

        Err(if attempted {
            IonError::NoMemory
        } else {
            IonError::InvalidArg
        })
    }
}
