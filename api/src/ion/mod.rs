//! Ion (Android ION) 物理内存分配器
//!
//! Ion 用于在不同的硬件组件（如 GPU、摄像头、显示器、视频编解码器等）之间
//! 共享物理内存缓冲区。一个设备上可以注册多个堆，每个堆绑定一段物理内存
//! 或一个页来源，以及一种分配策略。
//!
//! ## 特性
//!
//! - 四种堆后端：carveout、CMA、HPA（固定阶的大页块）和 RBIN（可回收区域）
//! - 按堆掩码和优先级选择堆，支持受保护分配时的堆重定向
//! - 通过安全世界保护缓冲区（内容保护），并为其分配安全 IOVA
//! - 缓冲区引用计数管理，部分堆支持延迟释放，由每个堆的后台线程回收
//! - 低内存时回收延迟释放的缓冲区和池化的页
//! - 事件日志和碎片诊断
//!
//! ## 使用示例
//!
//! ```
//! use ion_api::ion::{
//!     CarveoutConfig, CarveoutHeap, IonConfig, IonDevice, IonFlags, Platform,
//! };
//!
//! let device = IonDevice::new(IonConfig::default(), Platform::default()).unwrap();
//! let heap = device
//!     .register_heap(CarveoutHeap::new(CarveoutConfig::new("carveout", 0x8000_0000, 0x10_0000)).unwrap())
//!     .unwrap();
//!
//! // 分配 4KB 内存，句柄离开作用域时释放
//! let buffer = device.allocate(4096, heap.mask(), IonFlags::CACHED).unwrap();
//! assert_eq!(buffer.info().size, 4096);
//! ```

mod buffer;
mod daemon;
mod debug;
mod device;
mod error;
mod event;
pub mod heap;
mod iova;
pub mod platform;
mod protect;
mod registry;
mod types;

pub use self::{
    buffer::{BufferLifecycle, BufferState, IonBuffer, MapState},
    debug::{BufferInfo, FreeGapReport},
    device::{IonConfig, IonDevice},
    error::{IonError, IonResult},
    event::{EventLog, IonEvent, IonEventType},
    heap::{
        CarveoutConfig, CarveoutHeap, CmaArea, CmaConfig, CmaHeap, ContiguousAllocator, HeapBackend,
        HpaConfig, HpaHeap, RbinConfig, RbinHeap, RbinStats,
    },
    iova::IovaPool,
    platform::{CacheOps, KernelMapper, Platform, TrustedWorld},
    protect::{BufferProtInfo, ProtectionDescriptor, ProtectionService},
    registry::{HeapAllocation, HeapHandle, HeapRegistry, HeapRemap, HeapStats, IonHeap},
    types::{Chunk, HeapFlags, HeapId, HeapInfo, IonFlags, IonHandle, IonHeapType, OwnerTask, PAGE_SIZE},
};
