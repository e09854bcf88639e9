use core::fmt;

use page_dev::{PAGE_SHIFT, PAGE_SIZE};

use crate::{FILE_PC, HEAD_PC, VERSION};

/// 删除栈之前的头部字段所占字节
const DELSTACK_OFFSET: usize = 160;

/// 删除栈容量，由头部两页的剩余空间决定
pub const DELSTACK_MAX: usize = (HEAD_PC as usize * PAGE_SIZE - DELSTACK_OFFSET) / 8;

/// 持久头部（页 0-1），整数一律小端
#[repr(C)]
#[derive(Clone)]
pub struct Header {
    /// 盘标签
    pub label: [u8; 64],
    /// 版本串 `UNFS-1.0`
    pub version: [u8; 16],
    /// 扇区数
    pub blockcount: u64,
    /// 整页数
    pub pagecount: u64,
    /// `[datapage, pagecount)` 里的空闲页数
    pub pagefree: u64,
    /// 扇区大小
    pub blocksize: u32,
    /// 页大小
    pub pagesize: u32,
    /// 数据区起始页
    pub datapage: u64,
    /// 下一个文件项槽位地址（向下生长，自身空闲）
    pub fdnextpage: u64,
    /// 文件项数
    pub fdcount: u64,
    /// 其中目录数
    pub dircount: u64,
    /// 位图长度，以 64 位字计
    pub mapsize: u64,
    /// 删除栈容量
    pub delmax: u32,
    /// 删除栈深度
    pub delcount: u32,
    /// 已删除文件项槽位的栈
    pub delstack: [u64; DELSTACK_MAX],
}

impl Header {
    pub fn label_str(&self) -> &str {
        cstr(&self.label)
    }

    pub fn version_str(&self) -> &str {
        cstr(&self.version)
    }

    /// 头部自身的算术约束：
    /// 文件项区加删除栈加下一个空槽正好落在盘尾
    pub fn fd_equation_holds(&self) -> bool {
        self.fdnextpage + (self.fdcount + self.delcount as u64 + 1) * FILE_PC == self.pagecount
    }

    /// 打开与检查共用的头部校验，`popcount` 是重数出来的位图置位数
    pub fn validate(&self, pagecount: u64, datapage: u64, popcount: u64) -> bool {
        let mapsize = (pagecount - datapage).div_ceil(64);
        if self.version_str() != VERSION {
            log::error!("bad version {:?}", self.version_str());
            return false;
        }
        if self.pagecount != pagecount
            || self.datapage != datapage
            || self.mapsize != mapsize
            || self.pagesize != PAGE_SIZE as u32
        {
            log::error!("geometry mismatch (pc={pagecount:#x} dp={datapage:#x})");
            return false;
        }
        if self.pagefree != pagecount - datapage - popcount {
            log::error!(
                "free page count {:#x} does not match bitmap ({popcount:#x} bits set)",
                self.pagefree
            );
            return false;
        }
        if self.delcount > self.delmax || !self.fd_equation_holds() {
            log::error!(
                "file entry region inconsistent (fp={:#x} fc={:#x} dc={})",
                self.fdnextpage,
                self.fdcount,
                self.delcount
            );
            return false;
        }
        true
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Label:       {}", self.label_str())?;
        writeln!(f, "Version:     {}", self.version_str())?;
        writeln!(f, "Block count: {:#x}", self.blockcount)?;
        writeln!(f, "Block size:  {:#x}", self.blocksize)?;
        writeln!(f, "Page count:  {:#x}", self.pagecount)?;
        writeln!(f, "Page size:   {:#x}", self.pagesize)?;
        writeln!(f, "Page free:   {:#x}", self.pagefree)?;
        writeln!(f, "Data page:   {:#x}", self.datapage)?;
        writeln!(f, "FD next:     {:#x}", self.fdnextpage)?;
        writeln!(f, "FD count:    {:#x}", self.fdcount)?;
        writeln!(f, "Dir count:   {:#x}", self.dircount)?;
        writeln!(f, "Del count:   {:#x}", self.delcount)?;
        writeln!(f, "Del max:     {:#x}", self.delmax)?;
        writeln!(f, "Map size:    {:#x}", self.mapsize)
    }
}

fn cstr(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

/// 头部与位图合用的一整块连续缓冲（共 `datapage` 页）。
///
/// 打开时整体读入、整体校验；之后按脏范围以最小页跨度写回。
pub struct HeaderBuf {
    words: Box<[u64]>,
}

impl HeaderBuf {
    /// 根据页数推算数据区起始页：头部两页加上盖得住
    /// `[datapage, pagecount)` 的位图页数
    pub fn datapage_for(pagecount: u64) -> u64 {
        let bits_per_page = (PAGE_SIZE * 8) as u64;
        HEAD_PC + pagecount.div_ceil(bits_per_page)
    }

    pub fn new(datapage: u64) -> Self {
        let words = vec![0u64; datapage as usize * (PAGE_SIZE / 8)].into_boxed_slice();
        Self { words }
    }

    #[inline]
    pub fn header(&self) -> &Header {
        unsafe { &*self.words.as_ptr().cast() }
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut Header {
        unsafe { &mut *self.words.as_mut_ptr().cast() }
    }

    /// 位图的字视图
    #[inline]
    pub fn map(&self) -> &[u64] {
        &self.words[HEAD_PC as usize * PAGE_SIZE / 8..]
    }

    #[inline]
    pub fn map_mut(&mut self) -> &mut [u64] {
        &mut self.words[HEAD_PC as usize * PAGE_SIZE / 8..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.words.as_ptr().cast(), self.words.len() * 8) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.words.len() * 8)
        }
    }

    /// 头部那两页
    pub fn head_bytes(&self) -> &[u8] {
        &self.as_bytes()[..(HEAD_PC as usize) << PAGE_SHIFT]
    }

    /// 位图里从第 `mp` 页起 `pc` 页的字节
    pub fn map_page_bytes(&self, mp: u64, pc: u64) -> &[u8] {
        let start = ((HEAD_PC + mp) as usize) << PAGE_SHIFT;
        let end = start + ((pc as usize) << PAGE_SHIFT);
        &self.as_bytes()[start..end]
    }
}
