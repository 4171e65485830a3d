//! 诊断接口：按堆列出缓冲区、统计连续堆的空隙

use alloc::{string::String, vec::Vec};
use core::fmt;

use super::{
    buffer::BufferLifecycle,
    device::IonDevice,
    error::{IonError, IonResult},
    types::{HeapId, IonFlags, IonHandle, OwnerTask},
};

/// 一个缓冲区的诊断信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub handle: IonHandle,
    pub flags: IonFlags,
    pub size: usize,
    pub owner: OwnerTask,
    pub lifecycle: BufferLifecycle,
    pub chunk_count: usize,
}

/// 连续堆上相邻分配之间的空隙
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeGapReport {
    pub heap_name: String,
    /// 按物理地址排序的 `(起始地址, 长度)`
    pub gaps: Vec<(usize, usize)>,
}

impl FreeGapReport {
    pub fn total(&self) -> usize {
        self.gaps.iter().map(|&(_, len)| len).sum()
    }

    pub fn largest(&self) -> usize {
        self.gaps.iter().map(|&(_, len)| len).max().unwrap_or(0)
    }
}

impl fmt::Display for FreeGapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: free gaps", self.heap_name)?;
        for &(start, len) in &self.gaps {
            writeln!(f, "  {:#014x}-{:#014x} {:#x}", start, start + len, len)?;
        }
        write!(f, "  total {:#x}, largest {:#x}", self.total(), self.largest())
    }
}

impl IonDevice {
    /// 列出某个堆上尚未归还物理内存的所有缓冲区，按 ID 排序
    pub fn heap_buffers(&self, heap_id: HeapId) -> Vec<BufferInfo> {
        self.buffers()
            .collect(|buffer| buffer.heap_id == heap_id)
            .into_iter()
            .map(|buffer| BufferInfo {
                handle: buffer.handle,
                flags: buffer.flags,
                size: buffer.size,
                owner: buffer.owner.clone(),
                lifecycle: buffer.lifecycle(),
                chunk_count: buffer.chunks.len(),
            })
            .collect()
    }

    /// 按物理地址遍历连续堆上的分配，报告它们之间的空隙
    ///
    /// 只用于诊断，不影响分配决策。
    pub fn free_gap_report(&self, heap_id: HeapId) -> IonResult<FreeGapReport> {
        let heap = self.heap(heap_id).ok_or(IonError::InvalidArg)?;
        let (base, size) = heap.backend().region().ok_or(IonError::NotSupported)?;
        let (base, end) = (base.as_usize(), base.as_usize() + size);

        let mut used: Vec<(usize, usize)> = self
            .buffers()
            .collect(|buffer| buffer.heap_id == heap_id)
            .iter()
            .flat_map(|buffer| buffer.chunks.iter().map(|chunk| (chunk.start(), chunk.end())))
            .collect();
        used.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = base;
        for (start, chunk_end) in used {
            if start > cursor {
                gaps.push((cursor, start - cursor));
            }
            cursor = cursor.max(chunk_end);
        }
        if end > cursor {
            gaps.push((cursor, end - cursor));
        }

        Ok(FreeGapReport {
            heap_name: heap.name().into(),
            gaps,
        })
    }
}
