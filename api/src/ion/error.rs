//! Ion 驱动错误类型定义

use core::fmt;

use axerrno::AxError;

/// Ion 驱动错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IonError {
    /// 无效参数（零长度、未知的堆或缓冲区、重复释放、无法满足的对齐）
    InvalidArg,
    /// 权限不足（未请求保护却选中了不可触碰的堆）
    PermissionDenied,
    /// 内存不足
    NoMemory,
    /// 安全世界拒绝保护
    ProtectionRejected,
    /// 安全世界拒绝解除保护，内存被故意泄漏
    UnprotectFailed,
    /// 操作不支持
    NotSupported,
}

impl IonError {
    /// 获取错误码 (兼容 Linux errno 风格)
    pub fn as_errno(&self) -> i32 {
        match self {
            IonError::InvalidArg => -22,         // EINVAL
            IonError::PermissionDenied => -13,   // EACCES
            IonError::NoMemory => -12,           // ENOMEM
            IonError::ProtectionRejected => -1,  // EPERM
            IonError::UnprotectFailed => -5,     // EIO
            IonError::NotSupported => -95,       // EOPNOTSUPP
        }
    }
}

impl fmt::Display for IonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg => write!(f, "Invalid argument"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::NoMemory => write!(f, "Out of memory"),
            Self::ProtectionRejected => write!(f, "Buffer protection rejected"),
            Self::UnprotectFailed => write!(f, "Buffer unprotection failed"),
            Self::NotSupported => write!(f, "Operation not supported"),
        }
    }
}

impl core::error::Error for IonError {}

impl From<IonError> for AxError {
    fn from(err: IonError) -> Self {
        match err {
            IonError::InvalidArg => AxError::InvalidInput,
            IonError::PermissionDenied | IonError::ProtectionRejected => AxError::PermissionDenied,
            IonError::NoMemory => AxError::NoMemory,
            IonError::UnprotectFailed => AxError::Io,
            IonError::NotSupported => AxError::Unsupported,
        }
    }
}

pub type IonResult<T> = Result<T, IonError>;
