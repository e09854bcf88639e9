//! 内存节点与文件引擎
//!
//! 每个节点配一把读写锁；文件的数据段表整个在内存里，
//! 尺寸调整、段合并、分块读写都在这里完成。
//! 涉及页分配的路径由调用者先持有文件系统写锁再进来。

use std::sync::RwLock;

use page_dev::{Ioc, PageDevice, PAGE_SHIFT, PAGE_SIZE};

use crate::layout::{DiskNode, Segment, MAX_DS};
use crate::map::Allocator;
use crate::{page_count, FsError, Result, FILE_PC};

/// 名字树持有的带锁节点
pub(crate) struct NodeCell {
    pub state: RwLock<NodeState>,
}

impl NodeCell {
    pub fn new(state: NodeState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }
}

/// 节点的可变状态，持久字段加内存簿记
pub(crate) struct NodeState {
    /// 规范名
    pub name: String,
    /// 自身槽位页地址；打开扫描期间父目录可能先占位为 0
    pub pageid: u64,
    /// 父目录槽位页地址
    pub parentid: u64,
    /// 文件字节数，目录的直接子节点数
    pub size: u64,
    pub isdir: bool,
    /// 数据段表，目录恒空
    pub ds: Vec<Segment>,
    /// 打开计数
    pub open: u32,
    /// 持久字段改过但还没写回
    pub updated: bool,
}

impl NodeState {
    pub fn new_dir(name: &str, pageid: u64, parentid: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            pageid,
            parentid,
            size,
            isdir: true,
            ds: Vec::new(),
            open: 0,
            updated: false,
        }
    }

    /// 把两页文件项（记录页 + 名字页）写回设备
    pub fn sync(&self, dev: &dyn PageDevice, ioc: Ioc) {
        log::debug!(
            "sync {} page={:#x} size={:#x} dsc={}",
            self.name,
            self.pageid,
            self.size,
            self.ds.len()
        );
        let mut buf = dev.page_alloc(ioc, FILE_PC as u32);
        assert!(buf.pages() as u64 >= FILE_PC, "cannot allocate entry pages");
        let rec: &mut DiskNode = buf.get_mut(0);
        rec.pageid = self.pageid;
        rec.parentid = self.parentid;
        rec.size = self.size;
        rec.isdir = self.isdir as u32;
        rec.dscount = self.ds.len() as u32;
        if !self.isdir {
            rec.ds[..self.ds.len()].copy_from_slice(&self.ds);
        }
        let name_page = &mut buf.as_bytes_mut()[PAGE_SIZE..2 * PAGE_SIZE];
        name_page[..self.name.len()].copy_from_slice(self.name.as_bytes());
        name_page[self.name.len()] = 0;
        dev.write(ioc, buf.as_bytes(), self.pageid, FILE_PC as u32);
        dev.page_free(ioc, buf);
    }

    /// 调整文件大小。
    ///
    /// 增长时先把旧末页的尾巴按 `fill` 补齐，再整段申请新页；
    /// 新段与末段相接就并入末段，段表满了就整体合并成一段。
    /// 收缩从尾段开始裁剪，裁空的段删掉。
    pub fn resize(
        &mut self,
        dev: &dyn PageDevice,
        ioc: Ioc,
        alloc: &mut Allocator,
        newsize: u64,
        fill: Option<u8>,
    ) -> Result<()> {
        let oldsize = self.size;
        log::debug!("resize {} from {oldsize:#x} to {newsize:#x}", self.name);
        if oldsize == newsize {
            return Ok(());
        }

        if newsize > oldsize {
            let zlen = (oldsize & (PAGE_SIZE as u64 - 1)) as usize;
            if let Some(fill) = fill {
                if zlen != 0 {
                    let ds = self.ds.last().unwrap();
                    let pa = ds.pageid + ds.pagecount - 1;
                    let mut buf = dev.page_alloc(ioc, 1);
                    dev.read(ioc, &mut buf.as_bytes_mut()[..PAGE_SIZE], pa, 1);
                    buf.as_bytes_mut()[zlen..PAGE_SIZE].fill(fill);
                    dev.write(ioc, &buf.as_bytes()[..PAGE_SIZE], pa, 1);
                    dev.page_free(ioc, buf);
                }
            }

            let addpc = page_count(newsize) - page_count(oldsize);
            if addpc > 0 {
                let pageid;
                if self.ds.len() < MAX_DS {
                    let pa = alloc.alloc(addpc).ok_or(FsError::NoSpace)?;
                    match self.ds.last_mut() {
                        // 与末段正好相接
                        Some(last) if pa == last.pageid + last.pagecount => {
                            last.pagecount += addpc;
                        }
                        _ => self.ds.push(Segment {
                            pageid: pa,
                            pagecount: addpc,
                        }),
                    }
                    pageid = pa;
                } else {
                    self.merge_ds(dev, ioc, alloc, newsize)?;
                    pageid = self.ds[0].pageid + page_count(oldsize);
                }

                if let Some(fill) = fill {
                    let mut buf = dev.page_alloc(ioc, addpc.min(u32::MAX as u64) as u32);
                    let bufpc = buf.pages() as u64;
                    buf.as_bytes_mut().fill(fill);
                    let mut pa = pageid;
                    let mut remaining = addpc;
                    while remaining > 0 {
                        let pc = remaining.min(bufpc);
                        dev.write(
                            ioc,
                            &buf.as_bytes()[..(pc as usize) << PAGE_SHIFT],
                            pa,
                            pc as u32,
                        );
                        pa += pc;
                        remaining -= pc;
                    }
                    dev.page_free(ioc, buf);
                }
            }
        } else {
            let mut delpc = page_count(oldsize) - page_count(newsize);
            while delpc > 0 {
                let last = self.ds.last_mut().unwrap();
                if last.pagecount > delpc {
                    last.pagecount -= delpc;
                    alloc.free(last.pageid + last.pagecount, delpc);
                    break;
                }
                delpc -= last.pagecount;
                alloc.free(last.pageid, last.pagecount);
                self.ds.pop();
            }
        }

        self.size = newsize;
        self.updated = true;
        Ok(())
    }

    /// 把全部数据段搬进一段新申请的连续区域，旧段归还位图。
    /// 段表到达上限后继续增长走这里。
    fn merge_ds(
        &mut self,
        dev: &dyn PageDevice,
        ioc: Ioc,
        alloc: &mut Allocator,
        newsize: u64,
    ) -> Result<()> {
        log::debug!(
            "merge {} dsc={} size={newsize:#x}",
            self.name,
            self.ds.len()
        );
        let pagecount = page_count(newsize);
        let pageid = alloc.alloc(pagecount).ok_or(FsError::NoSpace)?;

        let mut buf = dev.page_alloc(ioc, pagecount.min(u32::MAX as u64) as u32);
        let bufpc = buf.pages() as u64;
        let mut pa = pageid;
        for ds in &self.ds {
            let mut dspa = ds.pageid;
            let mut dspc = ds.pagecount;
            while dspc > 0 {
                let pc = dspc.min(bufpc);
                let len = (pc as usize) << PAGE_SHIFT;
                dev.read(ioc, &mut buf.as_bytes_mut()[..len], dspa, pc as u32);
                dev.write(ioc, &buf.as_bytes()[..len], pa, pc as u32);
                pa += pc;
                dspa += pc;
                dspc -= pc;
            }
        }
        dev.page_free(ioc, buf);

        for ds in std::mem::take(&mut self.ds) {
            alloc.free(ds.pageid, ds.pagecount);
        }
        self.ds.push(Segment { pageid, pagecount });
        self.updated = true;
        Ok(())
    }

    /// 定位字节偏移所在的段，返回（段下标、段内起始页、段剩余页数）
    fn seek(&self, offset: u64) -> (usize, u64, u64) {
        let mut dsi = 0;
        let mut pageoff = offset >> PAGE_SHIFT;
        while pageoff >= self.ds[dsi].pagecount {
            pageoff -= self.ds[dsi].pagecount;
            dsi += 1;
        }
        (
            dsi,
            self.ds[dsi].pageid + pageoff,
            self.ds[dsi].pagecount - pageoff,
        )
    }

    /// 从 `offset` 起读满 `out`，调用者保证不越过文件末尾。
    /// 每轮传输量受当前段剩余与暂存缓冲两头钳制。
    pub fn read_at(&self, dev: &dyn PageDevice, ioc: Ioc, offset: u64, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        let (mut dsi, mut pa, mut dspc) = self.seek(offset);
        let mut byteoff = (offset & (PAGE_SIZE as u64 - 1)) as usize;
        let mut pagecount = page_count(byteoff as u64 + out.len() as u64);
        let mut len = out.len();
        let mut done = 0usize;

        let mut buf = dev.page_alloc(ioc, pagecount.min(u32::MAX as u64) as u32);
        let bufpc = buf.pages() as u64;
        loop {
            let pc = pagecount.min(dspc).min(bufpc);
            let span = (pc as usize) << PAGE_SHIFT;
            let iolen = (span - byteoff).min(len);
            dev.read(ioc, &mut buf.as_bytes_mut()[..span], pa, pc as u32);
            out[done..done + iolen].copy_from_slice(&buf.as_bytes()[byteoff..byteoff + iolen]);

            done += iolen;
            len -= iolen;
            if len == 0 {
                break;
            }
            pagecount -= pc;
            byteoff = 0;
            if pc < dspc {
                pa += pc;
                dspc -= pc;
            } else {
                dsi += 1;
                pa = self.ds[dsi].pageid;
                dspc = self.ds[dsi].pagecount;
            }
        }
        dev.page_free(ioc, buf);
    }

    /// 把 `data` 写到 `offset` 起的区域，页都已分配好。
    /// 首尾非整页先读回再覆盖，整页直接写。
    pub fn write_at(&self, dev: &dyn PageDevice, ioc: Ioc, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let (mut dsi, mut pa, mut dspc) = self.seek(offset);
        let mut byteoff = (offset & (PAGE_SIZE as u64 - 1)) as usize;
        let mut pagecount = page_count(byteoff as u64 + data.len() as u64);
        let mut endlen = ((byteoff + data.len()) & (PAGE_SIZE - 1)) as usize;
        let mut len = data.len();
        let mut done = 0usize;

        let mut buf = dev.page_alloc(ioc, pagecount.min(u32::MAX as u64) as u32);
        let bufpc = buf.pages() as u64;
        loop {
            let pc = pagecount.min(dspc).min(bufpc);
            let span = (pc as usize) << PAGE_SHIFT;
            let iolen = (span - byteoff).min(len);

            if byteoff != 0 {
                // 首页部分写，读回再覆盖
                dev.read(ioc, &mut buf.as_bytes_mut()[..PAGE_SIZE], pa, 1);
                if endlen != 0 && pagecount == 1 {
                    // 单页首尾共用这一次读回
                    endlen = 0;
                }
            }
            if endlen != 0 && pc == pagecount {
                // 尾页部分写
                let n = ((pc - 1) as usize) << PAGE_SHIFT;
                dev.read(ioc, &mut buf.as_bytes_mut()[n..n + PAGE_SIZE], pa + pc - 1, 1);
            }
            buf.as_bytes_mut()[byteoff..byteoff + iolen]
                .copy_from_slice(&data[done..done + iolen]);
            dev.write(ioc, &buf.as_bytes()[..span], pa, pc as u32);

            done += iolen;
            len -= iolen;
            if len == 0 {
                break;
            }
            pagecount -= pc;
            byteoff = 0;
            if pc < dspc {
                pa += pc;
                dspc -= pc;
            } else {
                dsi += 1;
                pa = self.ds[dsi].pageid;
                dspc = self.ds[dsi].pagecount;
            }
        }
        dev.page_free(ioc, buf);
    }

    /// 按段序滚动求和的 64 位校验和：每个字节贡献
    /// `(剩余字节数 << 32) | 字节值`。不保证内容唯一，只求可复现。
    pub fn checksum(&self, dev: &dyn PageDevice, ioc: Ioc) -> u64 {
        let mut sum = 0u64;
        let mut remaining = self.size;
        let mut buf = dev.page_alloc(ioc, 1);
        'all: for ds in &self.ds {
            for p in 0..ds.pagecount {
                dev.read(ioc, &mut buf.as_bytes_mut()[..PAGE_SIZE], ds.pageid + p, 1);
                for &b in &buf.as_bytes()[..PAGE_SIZE] {
                    sum = sum.wrapping_add(remaining.wrapping_shl(32) | b as u64);
                    remaining -= 1;
                    if remaining == 0 {
                        break 'all;
                    }
                }
            }
        }
        dev.page_free(ioc, buf);
        sum
    }
}
