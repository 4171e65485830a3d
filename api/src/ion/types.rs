//! Ion 驱动数据结构定义

use alloc::string::{String, ToString};

use bitflags::bitflags;
use memory_addr::{PAGE_SIZE_4K, PhysAddr, PhysAddrRange};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 页大小
pub const PAGE_SIZE: usize = PAGE_SIZE_4K;

/// 最多可注册的堆数量（堆掩码为 32 位）
pub const MAX_HEAPS: usize = u32::BITS as usize;

/// Ion 堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum IonHeapType {
    /// Carveout 堆，预留的物理连续内存区域
    Carveout = 2,
    /// CMA 堆，内核可回收的连续内存
    Cma = 4,
    /// HPA 堆，固定阶数的高阶页块
    Hpa = 6,
    /// RBIN 堆，带后台回收线程的可回收堆
    Rbin = 7,
}

impl IonHeapType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Carveout => "carveout",
            Self::Cma => "cma",
            Self::Hpa => "hpa",
            Self::Rbin => "rbin",
        }
    }
}

bitflags! {
    /// Ion 缓冲区标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IonFlags: u32 {
        /// 缓存标志
        const CACHED = 1 << 0;
        /// 释放时不清零
        const NOZEROED = 1 << 3;
        /// 受 TrustZone 保护
        const PROTECTED = 1 << 4;
        /// 强制 cache 同步
        const SYNC_FORCE = 1 << 5;
        /// 可能被 GPU 渲染
        const MAY_HWRENDER = 1 << 6;
    }
}

bitflags! {
    /// 堆能力标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeapFlags: u32 {
        /// 支持安全保护
        const SECURE = 1 << 0;
        /// 支持延迟释放
        const DEFER_FREE = 1 << 1;
        /// 不可触碰：未保护时禁止 CPU/GPU 映射
        const UNTOUCHABLE = 1 << 2;
    }
}

/// Ion 缓冲区句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct IonHandle(pub u32);

impl IonHandle {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// 堆 ID，同时是堆掩码中的位号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HeapId(pub u32);

impl HeapId {
    /// 仅选中此堆的掩码
    pub fn mask(self) -> u32 {
        1 << self.0
    }
}

/// 一段物理连续内存
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub addr: PhysAddr,
    pub len: usize,
}

impl Chunk {
    pub fn new(addr: usize, len: usize) -> Self {
        Self {
            addr: PhysAddr::from(addr),
            len,
        }
    }

    pub fn start(&self) -> usize {
        self.addr.as_usize()
    }

    pub fn end(&self) -> usize {
        self.addr.as_usize() + self.len
    }

    pub fn range(&self) -> PhysAddrRange {
        PhysAddrRange::from_start_size(self.addr, self.len)
    }

    /// 是否与 `[start, end)` 相交
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start() < end && start < self.end()
    }
}

/// 堆查询信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapInfo {
    pub name: String,
    pub heap_type: IonHeapType,
    pub id: HeapId,
    pub size: usize,
    pub flags: HeapFlags,
}

/// 创建缓冲区的任务（仅用于诊断）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerTask {
    pub name: String,
    pub pid: u32,
}

impl OwnerTask {
    pub fn current() -> Self {
        let thread = std::thread::current();
        Self {
            name: thread.name().unwrap_or("<unnamed>").to_string(),
            pid: std::process::id(),
        }
    }
}
