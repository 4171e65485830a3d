//! 区间池分配器
//!
//! 首次适配 (first-fit) 的切分/合并空闲区间表，按地址排序以便在释放时与
//! 相邻区间合并。carveout、CMA、IOVA 池以及 rbin 的后备区域都建立在它之上。

use alloc::{collections::BTreeMap, vec::Vec};

use memory_addr::align_up;

/// 管理 `[base, base + size)` 的空闲区间表
///
/// # Invariants
/// - 所有空闲区间互不重叠、互不相邻（相邻的区间在插入时已合并）。
/// - 每个空闲区间的起始地址和长度都是 `min_align` 的倍数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePool {
    base: usize,
    size: usize,
    min_align: usize,
    /// 起始地址 -> 长度
    free: BTreeMap<usize, usize>,
}

impl RangePool {
    /// 创建一个整个区域都空闲的池
    ///
    /// `min_align` 必须是 2 的幂，`base` 和 `size` 按它对齐。
    pub fn new(base: usize, size: usize, min_align: usize) -> Self {
        debug_assert!(min_align.is_power_of_two());
        debug_assert!(base % min_align == 0 && size % min_align == 0);
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, size);
        }
        Self {
            base,
            size,
            min_align,
            free,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn min_align(&self) -> usize {
        self.min_align
    }

    /// 分配 `size` 字节，起始地址按 `align` 对齐
    ///
    /// 长度向上取整到 `min_align`，对齐不小于 `min_align`。
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let size = align_up(size, self.min_align);
        let align = align.max(self.min_align);

        let (region_start, region_len, alloc_start) =
            self.free.iter().find_map(|(&start, &len)| {
                let alloc_start = align_up(start, align);
                let alloc_end = alloc_start.checked_add(size)?;
                (alloc_end <= start + len).then_some((start, len, alloc_start))
            })?;

        // 将选中的区间切成头尾两段剩余
        self.free.remove(&region_start);
        if alloc_start > region_start {
            self.free.insert(region_start, alloc_start - region_start);
        }
        let region_end = region_start + region_len;
        let alloc_end = alloc_start + size;
        if region_end > alloc_end {
            self.free.insert(alloc_end, region_end - alloc_end);
        }
        Some(alloc_start)
    }

    /// 归还 `[start, start + size)`
    ///
    /// 区间越界或与空闲区间重叠（重复释放）时返回 `false`，池不变。
    pub fn free(&mut self, start: usize, size: usize) -> bool {
        let size = align_up(size, self.min_align);
        let end = match start.checked_add(size) {
            Some(end) => end,
            None => return false,
        };
        if size == 0 || start < self.base || end > self.base + self.size {
            return false;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..end).next_back() {
            if prev + prev_len > start {
                return false;
            }
        }

        let mut new_start = start;
        let mut new_len = size;
        // 与前一个区间合并
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                new_start = prev;
                new_len += prev_len;
            }
        }
        // 与后一个区间合并
        if let Some(next_len) = self.free.remove(&end) {
            new_len += next_len;
        }
        self.free.insert(new_start, new_len);
        true
    }

    /// 取出地址最低的空闲区间，最多 `max_len` 字节
    pub fn take_extent(&mut self, max_len: usize) -> Option<(usize, usize)> {
        let max_len = max_len - max_len % self.min_align;
        if max_len == 0 {
            return None;
        }
        let (start, len) = self.free.pop_first()?;
        if len > max_len {
            self.free.insert(start + max_len, len - max_len);
            return Some((start, max_len));
        }
        Some((start, len))
    }

    /// 空闲字节数
    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    /// 最大空闲区间长度
    pub fn largest_extent(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// 按地址排序的空闲区间快照
    pub fn free_ranges(&self) -> Vec<(usize, usize)> {
        self.free.iter().map(|(&start, &len)| (start, len)).collect()
    }
}
