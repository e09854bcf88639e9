//! # 页设备接口层
//!
//! 文件系统与底层设备之间的契约：设备以固定 4 KiB 页为单位寻址，
//! I/O 上下文充当并发令牌（对应一条设备队列），每个上下文同一时刻
//! 至多绑定一块暂存页缓冲。
//!
//! 后端按设备名的形态选择：PCI 地址（`XX:XX.X`）交给 NVMe 用户态
//! 驱动后端，其余名字当作裸块设备或镜像文件交给 [`RawDisk`]。

use std::io;
use std::sync::Arc;

use derive_more::{From, Into};

mod raw;

pub use self::raw::RawDisk;

/// 页大小移位值
pub const PAGE_SHIFT: u32 = 12;
/// 固定页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// 设备几何信息
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// 扇区数
    pub blockcount: u64,
    /// 扇区大小，不大于页大小
    pub blocksize: u32,
    /// 整页数
    pub pagecount: u64,
}

/// I/O 上下文令牌
#[derive(Debug, Clone, Copy, PartialEq, Eq, From, Into)]
pub struct Ioc(u32);

/// 与 I/O 上下文绑定的页缓冲。
///
/// 按 64 位字分配，保证把页内容映射成 `#[repr(C)]` 磁盘记录时
/// 对齐总是成立。
pub struct PageBuf {
    words: Box<[u64]>,
    pages: u32,
}

impl PageBuf {
    pub fn new(pages: u32) -> Self {
        let words = vec![0u64; pages as usize * (PAGE_SIZE / 8)].into_boxed_slice();
        Self { words, pages }
    }

    /// 实际拿到的页数，后端可能比请求的少
    #[inline]
    pub fn pages(&self) -> u32 {
        self.pages
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self.words.as_ptr().cast(), self.words.len() * 8)
        }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.words.len() * 8)
        }
    }

    /// 把字节偏移处映射成磁盘记录，偏移必须 8 字节对齐
    pub fn get<T: Sized>(&self, offset: usize) -> &T {
        let type_size = core::mem::size_of::<T>();
        assert!(type_size + offset <= self.as_bytes().len());
        assert_eq!(offset % 8, 0);
        unsafe { &*self.as_bytes().as_ptr().add(offset).cast() }
    }

    pub fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        let type_size = core::mem::size_of::<T>();
        assert!(type_size + offset <= self.as_bytes().len());
        assert_eq!(offset % 8, 0);
        unsafe { &mut *self.as_bytes_mut().as_mut_ptr().add(offset).cast() }
    }
}

/// 设备 I/O 契约。
///
/// `read`/`write` 是同步的页对齐传输；设备层面的失败不可恢复，
/// 实现直接带诊断信息 panic，由上层的崩溃语义兜底。
pub trait PageDevice: Send + Sync {
    /// 设备名
    fn name(&self) -> &str;

    /// 打开时探明的几何信息
    fn geometry(&self) -> Geometry;

    /// 取一个并发令牌
    fn ioc_alloc(&self) -> Ioc;

    fn ioc_free(&self, ioc: Ioc);

    /// 申请至多 `pc` 页的暂存缓冲，可能被钳到更小；
    /// 同一上下文在归还之前不得再次申请。
    fn page_alloc(&self, ioc: Ioc, pc: u32) -> PageBuf;

    fn page_free(&self, ioc: Ioc, buf: PageBuf);

    /// 从页地址 `pa` 读 `pc` 页到缓冲
    fn read(&self, ioc: Ioc, buf: &mut [u8], pa: u64, pc: u32);

    /// 把缓冲写到页地址 `pa` 起的 `pc` 页
    fn write(&self, ioc: Ioc, buf: &[u8], pa: u64, pc: u32);
}

/// 按名字形态挑选后端并打开设备
pub fn open_device(device: &str) -> io::Result<Arc<dyn PageDevice>> {
    if is_pci_addr(device) {
        // NVMe 用户态驱动是独立组件，不在本仓库内
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{device}: no NVMe user-driver backend linked"),
        ))
    } else {
        Ok(Arc::new(RawDisk::open(device)?))
    }
}

fn is_pci_addr(device: &str) -> bool {
    let Some((bus, rest)) = device.split_once(':') else {
        return false;
    };
    let Some((dev, func)) = rest.split_once('.') else {
        return false;
    };
    [bus, dev, func]
        .iter()
        .all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()))
}
