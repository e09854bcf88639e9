use core::mem;

use page_dev::{PageBuf, PAGE_SIZE};

/// 数据段：一段连续页
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    /// 起始页地址
    pub pageid: u64,
    /// 页数
    pub pagecount: u64,
}

/// 记录页里段前的固定字段所占字节
const RECORD_FIELDS: usize = 32;

/// 单文件数据段数上限，由记录页剩余空间决定
pub const MAX_DS: usize = (PAGE_SIZE - RECORD_FIELDS) / mem::size_of::<Segment>();

/// 文件项记录页。文件与目录共用，目录没有数据段，
/// `size` 对目录是直接子节点数。第二页存 NUL 结尾的规范名。
#[repr(C)]
#[derive(Clone)]
pub struct DiskNode {
    /// 自身槽位页地址
    pub pageid: u64,
    /// 父目录槽位页地址
    pub parentid: u64,
    /// 文件字节数或目录子节点数
    pub size: u64,
    /// 目录标志
    pub isdir: u32,
    /// 数据段数
    pub dscount: u32,
    /// 数据段表
    pub ds: [Segment; MAX_DS],
}

/// 从两页文件项缓冲的 `offset` 字节处取出规范名
pub fn entry_name(buf: &PageBuf, offset: usize) -> Option<&str> {
    let page = &buf.as_bytes()[offset + PAGE_SIZE..offset + 2 * PAGE_SIZE];
    let end = page.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&page[..end]).ok()
}
