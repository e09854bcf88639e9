//! 打开的文件描述符
//!
//! 描述符持有节点与文件系统内部状态的共享引用。数据读写只握
//! 节点锁；可能改变页分配的操作（调整大小、越界写）先拿文件
//! 系统写锁再拿节点锁，锁序全程固定。

use std::sync::{Arc, RwLock};

use enumflags2::{bitflags, BitFlags};

use page_dev::PageDevice;

use crate::fs::Core;
use crate::layout::Segment;
use crate::node::NodeCell;
use crate::{FsError, Result};

/// 打开模式
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// 不存在则创建
    Create = 0x01,
    /// 只读访问，写与调整大小都被拒绝
    ReadOnly = 0x02,
    /// 独占访问，节点已被打开则失败
    Exclusive = 0x40,
}

/// 文件状态快照：字节数与数据段表
#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub segments: Vec<Segment>,
}

/// 打开的文件。丢弃即关闭：打开计数减一，
/// 改过的元数据随手写回。
pub struct File {
    dev: Arc<dyn PageDevice>,
    inner: Arc<RwLock<Core>>,
    cell: Arc<NodeCell>,
    mode: BitFlags<OpenMode>,
}

impl File {
    pub(crate) fn new(
        dev: Arc<dyn PageDevice>,
        inner: Arc<RwLock<Core>>,
        cell: Arc<NodeCell>,
        mode: BitFlags<OpenMode>,
    ) -> Self {
        Self {
            dev,
            inner,
            cell,
            mode,
        }
    }

    /// 规范名
    pub fn name(&self) -> String {
        self.cell.state.read().unwrap().name.clone()
    }

    pub fn stat(&self) -> FileStat {
        let st = self.cell.state.read().unwrap();
        FileStat {
            size: st.size,
            segments: st.ds.clone(),
        }
    }

    /// 调整文件大小；`fill` 给定时新增区域按该字节填充
    pub fn resize(&self, newsize: u64, fill: Option<u8>) -> Result<()> {
        if self.mode.contains(OpenMode::ReadOnly) {
            return Err(FsError::InvalidArgument);
        }
        let dev = &*self.dev;
        // 改分配，文件系统写锁在前
        let mut core = self.inner.write().unwrap();
        let mut st = self.cell.state.write().unwrap();
        let ioc = dev.ioc_alloc();
        let res = st.resize(dev, ioc, &mut core.alloc, newsize, fill);
        dev.ioc_free(ioc);
        res
    }

    /// 从 `offset` 读满 `buf`，越过文件末尾即出错
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let dev = &*self.dev;
        let st = self.cell.state.read().unwrap();
        if offset + buf.len() as u64 > st.size {
            log::error!(
                "read {} off={offset:#x} len={:#x} size={:#x}",
                st.name,
                buf.len(),
                st.size
            );
            return Err(FsError::InvalidArgument);
        }
        let ioc = dev.ioc_alloc();
        st.read_at(dev, ioc, offset, buf);
        dev.ioc_free(ioc);
        Ok(())
    }

    /// 把 `data` 写到 `offset` 起的区域，超出当前大小先扩容
    pub fn write(&self, data: &[u8], offset: u64) -> Result<()> {
        if self.mode.contains(OpenMode::ReadOnly) {
            return Err(FsError::InvalidArgument);
        }
        if data.is_empty() {
            return Ok(());
        }
        let dev = &*self.dev;
        let end = offset + data.len() as u64;
        loop {
            if self.cell.state.read().unwrap().size < end {
                // 要扩容的写先拿文件系统写锁；拿齐两把锁后再确认，
                // 其间大小可能已被并发调整
                let mut core = self.inner.write().unwrap();
                let mut st = self.cell.state.write().unwrap();
                if st.size < end {
                    let ioc = dev.ioc_alloc();
                    if let Err(e) = st.resize(dev, ioc, &mut core.alloc, end, None) {
                        dev.ioc_free(ioc);
                        return Err(e);
                    }
                    // 页到手了，数据传输不再占文件系统锁
                    drop(core);
                    st.write_at(dev, ioc, offset, data);
                    dev.ioc_free(ioc);
                    return Ok(());
                }
            } else {
                let st = self.cell.state.write().unwrap();
                if st.size >= end {
                    let ioc = dev.ioc_alloc();
                    st.write_at(dev, ioc, offset, data);
                    dev.ioc_free(ioc);
                    return Ok(());
                }
            }
        }
    }

    /// 数据页的滚动校验和，弱校验，只求可复现
    pub fn checksum(&self) -> u64 {
        let dev = &*self.dev;
        let st = self.cell.state.read().unwrap();
        let ioc = dev.ioc_alloc();
        let sum = st.checksum(dev, ioc);
        dev.ioc_free(ioc);
        sum
    }

    /// 把节点项与头部写回设备，中途落盘点
    pub fn sync(&self) {
        let dev = &*self.dev;
        let core = self.inner.read().unwrap();
        let mut st = self.cell.state.write().unwrap();
        if st.updated {
            let ioc = dev.ioc_alloc();
            st.sync(dev, ioc);
            core.alloc.write_header(dev, ioc);
            dev.ioc_free(ioc);
            st.updated = false;
        }
    }

    /// 显式关闭，等价于丢弃
    pub fn close(self) {}
}

impl Drop for File {
    fn drop(&mut self) {
        let dev = &*self.dev;
        let Ok(core) = self.inner.read() else {
            return;
        };
        let Ok(mut st) = self.cell.state.write() else {
            return;
        };
        st.open -= 1;
        if st.updated {
            let ioc = dev.ioc_alloc();
            st.sync(dev, ioc);
            core.alloc.write_header(dev, ioc);
            dev.ioc_free(ioc);
            st.updated = false;
        }
    }
}
