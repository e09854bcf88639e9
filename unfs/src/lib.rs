//! # UNFS
//!
//! 运行在用户态的扁平命名空间文件系统。裸设备上只有三块持久结构：
//! 头部（含删除栈）、空闲页位图、从盘尾向下生长的文件项区；
//! 所有节点都以完整规范名记名，没有目录内查找结构，打开时整树重建。
//!
//! 自上而下的分层：

// 文件系统门面：格式化、检查、打开，以及名字树上的全部操作
mod fs;
pub use fs::{DirEntry, Unfs};

// 文件引擎：段表、尺寸调整、分块读写与校验和
mod file;
pub use file::{File, FileStat, OpenMode};

// 空闲页位图与文件项槽位的分配器
mod map;

// 内存节点
mod node;

// 磁盘数据结构层
mod layout;
pub use layout::{Header, Segment, MAX_DS};

mod error;
pub use error::{FsError, Result};

/// 文件系统版本串
pub const VERSION: &str = "UNFS-1.0";

/// 头部页数
pub const HEAD_PC: u64 = 2;

/// 位图起始页
pub const MAP_PA: u64 = HEAD_PC;

/// 每个文件项占用页数
pub const FILE_PC: u64 = 2;

/// 规范名长度上限
pub const MAX_PATH: usize = page_dev::PAGE_SIZE - 2;

/// 字节长度折算成页数
#[inline]
pub(crate) fn page_count(len: u64) -> u64 {
    len.div_ceil(page_dev::PAGE_SIZE as u64)
}
