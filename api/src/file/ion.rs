//! Ion Buffer 句柄
//!
//! 每个 [`BufferHandle`] 持有缓冲区的一个外部引用，克隆时增加引用，drop 时释放。

use alloc::{sync::Arc, vec::Vec};

use memory_addr::PhysAddrRange;

use crate::ion::{HeapId, IonBuffer, IonDevice, IonFlags, IonHandle, IonResult};

/// Ion Buffer 信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IonBufferInfo {
    /// 缓冲区 handle
    pub handle: IonHandle,
    /// 缓冲区大小
    pub size: usize,
    pub flags: IonFlags,
    /// 所属堆
    pub heap_id: HeapId,
}

/// Ion Buffer 句柄
pub struct BufferHandle {
    device: Arc<IonDevice>,
    info: IonBufferInfo,
}

impl BufferHandle {
    /// 接管 `buffer` 已有的一个引用
    pub(crate) fn new(device: Arc<IonDevice>, buffer: &IonBuffer) -> Self {
        Self {
            device,
            info: IonBufferInfo {
                handle: buffer.handle,
                size: buffer.size,
                flags: buffer.flags,
                heap_id: buffer.heap_id,
            },
        }
    }

    /// 获取缓冲区信息
    pub fn info(&self) -> &IonBufferInfo {
        &self.info
    }

    pub fn handle(&self) -> IonHandle {
        self.info.handle
    }

    /// 获取物理地址范围，用于用户态映射
    pub fn phys_ranges(&self) -> IonResult<Vec<PhysAddrRange>> {
        self.device.mmap(self.info.handle)
    }

    pub fn device(&self) -> &Arc<IonDevice> {
        &self.device
    }

    /// 把句柄换成裸缓冲区 ID，之后需要调用 [`IonDevice::release`]
    pub fn into_raw(self) -> IonResult<IonHandle> {
        self.device.dup(self.info.handle)?;
        Ok(self.info.handle)
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        if let Err(err) = self.device.dup(self.info.handle) {
            // 持有句柄期间引用计数不会归零
            error!("Failed to dup Ion buffer {}: {}", self.info.handle.as_u32(), err);
        }
        Self {
            device: self.device.clone(),
            info: self.info,
        }
    }
}

impl core::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferHandle").field("info", &self.info).finish()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        debug!("Dropping BufferHandle, releasing handle: {}", self.info.handle.as_u32());
        if let Err(err) = self.device.release(self.info.handle) {
            error!(
                "Failed to release Ion buffer handle {}: {}",
                self.info.handle.as_u32(),
                err
            );
        }
    }
}
