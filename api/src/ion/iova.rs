//! 安全 IOVA 池
//!
//! 受保护缓冲区在安全设备地址空间中占用的地址段由这里分配。

use memory_addr::align_up;
use spin::Mutex;

use super::{
    error::{IonError, IonResult},
    heap::pool::RangePool,
    types::PAGE_SIZE,
};

/// 设备地址以 32 位交给安全世界，窗口不能越过 4 GiB
const IOVA_LIMIT: u64 = 1 << 32;

/// 固定范围的设备地址分配器
pub struct IovaPool {
    max_align: usize,
    pool: Mutex<RangePool>,
}

impl IovaPool {
    /// 管理 `[base, base + size)`，超过 `max_align` 的对齐请求会被截断
    pub fn new(base: usize, size: usize, max_align: usize) -> IonResult<Self> {
        if size == 0
            || base % PAGE_SIZE != 0
            || size % PAGE_SIZE != 0
            || !max_align.is_power_of_two()
            || (base as u64)
                .checked_add(size as u64)
                .is_none_or(|end| end > IOVA_LIMIT)
        {
            return Err(IonError::InvalidArg);
        }
        Ok(Self {
            max_align: max_align.max(PAGE_SIZE),
            pool: Mutex::new(RangePool::new(base, size, PAGE_SIZE)),
        })
    }

    /// 预留 `size` 字节
    pub fn alloc(&self, size: usize, align: usize) -> IonResult<usize> {
        if size == 0 || !align.is_power_of_two() {
            return Err(IonError::InvalidArg);
        }
        let align = align.clamp(PAGE_SIZE, self.max_align);
        self.pool.lock().alloc(size, align).ok_or_else(|| {
            warn!("secure iova pool exhausted: size={:#x}", size);
            IonError::NoMemory
        })
    }

    /// 归还 `alloc` 得到的地址段
    pub fn free(&self, iova: usize, size: usize) {
        if !self.pool.lock().free(iova, align_up(size, PAGE_SIZE)) {
            error!("freeing invalid iova {:#x}+{:#x}", iova, size);
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.pool.lock().free_bytes()
    }
}
