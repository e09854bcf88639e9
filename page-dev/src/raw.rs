//! 裸设备后端
//!
//! 用带定位读写的普通文件实现页设备契约，块设备节点与镜像文件通用。
//! 容量靠 seek 到尾部探明，对 `/dev` 下的块设备同样有效。

use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;

use crate::{Geometry, Ioc, PageBuf, PageDevice, PAGE_SHIFT};

/// 扇区大小
const BLOCK_SIZE: u32 = 512;

/// 每个上下文的暂存页数上限；测试靠 `UNFS_IOMEMPC` 调小来逼出分块路径
const DEFAULT_IOMEMPC: u32 = 4096;

pub struct RawDisk {
    name: String,
    file: File,
    geometry: Geometry,
    iomempc: u32,
}

impl RawDisk {
    pub fn open(device: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(device)?;
        let bytes = (&file).seek(SeekFrom::End(0))?;
        let geometry = Geometry {
            blockcount: bytes / BLOCK_SIZE as u64,
            blocksize: BLOCK_SIZE,
            pagecount: bytes >> PAGE_SHIFT,
        };

        let iomempc = std::env::var("UNFS_IOMEMPC")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&pc| pc > 0)
            .unwrap_or(DEFAULT_IOMEMPC);

        log::debug!(
            "open {device}: {} pages, iomempc={iomempc}",
            geometry.pagecount
        );
        Ok(Self {
            name: device.to_string(),
            file,
            geometry,
            iomempc,
        })
    }
}

impl PageDevice for RawDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    // 裸设备没有队列的概念，令牌只有一个编号
    fn ioc_alloc(&self) -> Ioc {
        Ioc::from(0)
    }

    fn ioc_free(&self, _ioc: Ioc) {}

    fn page_alloc(&self, _ioc: Ioc, pc: u32) -> PageBuf {
        PageBuf::new(pc.clamp(1, self.iomempc))
    }

    fn page_free(&self, _ioc: Ioc, _buf: PageBuf) {}

    fn read(&self, _ioc: Ioc, buf: &mut [u8], pa: u64, pc: u32) {
        log::trace!("read {pa:#x} {pc:#x}");
        let len = (pc as usize) << PAGE_SHIFT;
        assert!(buf.len() >= len);
        self.file
            .read_exact_at(&mut buf[..len], pa << PAGE_SHIFT)
            .unwrap_or_else(|e| panic!("{}: read page {pa:#x} count {pc} ({e})", self.name));
    }

    fn write(&self, _ioc: Ioc, buf: &[u8], pa: u64, pc: u32) {
        log::trace!("write {pa:#x} {pc:#x}");
        let len = (pc as usize) << PAGE_SHIFT;
        assert!(buf.len() >= len);
        self.file
            .write_all_at(&buf[..len], pa << PAGE_SHIFT)
            .unwrap_or_else(|e| panic!("{}: write page {pa:#x} count {pc} ({e})", self.name));
    }
}
