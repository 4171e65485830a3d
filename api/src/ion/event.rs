//! Ion 事件日志
//!
//! 固定容量的环形缓冲区，满了以后覆盖最旧的事件。记录时只尝试加锁，
//! 锁被读者占用时丢弃事件，分配路径永远不会因此阻塞。

use alloc::{string::String, vec::Vec};
use core::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use std::time::Instant;

use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, RingBuffer},
};
use spin::Mutex;

use super::types::IonHandle;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IonEventType {
    Alloc,
    Free,
    Mmap,
    Kmap,
    Protect,
    Unprotect,
}

/// 一条事件记录
#[derive(Debug, Clone)]
pub struct IonEvent {
    pub heap_name: String,
    pub event_type: IonEventType,
    pub buffer_id: IonHandle,
    pub size: usize,
    /// 操作耗时
    pub duration: Duration,
    /// 相对日志创建时刻的时间戳
    pub timestamp: Duration,
}

/// 事件环形缓冲区
pub struct EventLog {
    ring: Mutex<HeapRb<IonEvent>>,
    epoch: Instant,
    dropped: AtomicUsize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            epoch: Instant::now(),
            dropped: AtomicUsize::new(0),
        }
    }

    /// 记录一个从 `begin` 开始、到现在结束的操作
    pub fn record(
        &self,
        heap_name: &str,
        event_type: IonEventType,
        buffer_id: IonHandle,
        size: usize,
        begin: Instant,
    ) {
        let now = Instant::now();
        let event = IonEvent {
            heap_name: heap_name.into(),
            event_type,
            buffer_id,
            size,
            duration: now.duration_since(begin),
            timestamp: now.duration_since(self.epoch),
        };
        match self.ring.try_lock() {
            Some(mut ring) => {
                ring.push_overwrite(event);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 从旧到新的事件快照
    pub fn snapshot(&self) -> Vec<IonEvent> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 因锁竞争丢弃的事件数
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
