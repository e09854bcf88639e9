use core::fmt;

/// 返回给调用者的错误码。
///
/// 设备中途读写失败与不变式破坏不在此列，它们直接终止进程。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 名字或参数不合法，头部校验不通过也归于此
    InvalidArgument,
    NotFound,
    AlreadyExists,
    /// 节点已被打开，或目录非空
    Busy,
    /// 空闲页或文件项槽耗尽
    NoSpace,
    /// 设备打不开
    Io,
}

pub type Result<T> = core::result::Result<T, FsError>;

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Busy => "busy",
            Self::NoSpace => "no space left on device",
            Self::Io => "device I/O error",
        };
        f.write_str(s)
    }
}

impl std::error::Error for FsError {}
