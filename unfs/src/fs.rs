//! 文件系统门面
//!
//! 一把文件系统读写锁罩住名字树、头部、位图与删除栈；
//! 结构性修改全部走写端，纯查询走读端。名字树是以完整规范名
//! 为键的有序映射，打开时从盘尾向下扫描文件项整树重建。

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use enumflags2::BitFlags;

use page_dev::{Ioc, PageBuf, PageDevice, PAGE_SIZE};

use crate::file::{File, OpenMode};
use crate::layout::{entry_name, DiskNode, Header, HeaderBuf};
use crate::map::Allocator;
use crate::node::{NodeCell, NodeState};
use crate::{FsError, Result, FILE_PC, MAX_PATH, VERSION};

/// 目录列表项，名字是完整规范名
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub isdir: bool,
}

pub(crate) struct Core {
    pub alloc: Allocator,
    pub tree: BTreeMap<String, Arc<NodeCell>>,
}

/// 文件系统实例。打开的文件各自持有内部状态的共享引用，
/// 实例本身释放时写回头部与位图并关闭设备。
pub struct Unfs {
    dev: Arc<dyn PageDevice>,
    inner: Arc<RwLock<Core>>,
    fsid: u64,
}

impl Unfs {
    /// 打开文件系统：读入头部与位图并校验，重建整棵名字树
    pub fn open(device: &str) -> Result<Self> {
        let dev = open_dev(device)?;
        let fsid = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        log::debug!("open {device} fsid={fsid:#x}");

        let ioc = dev.ioc_alloc();
        let load = Self::load(&*dev, ioc);
        let (alloc, fdcount, delstack) = match load {
            Ok(v) => v,
            Err(e) => {
                dev.ioc_free(ioc);
                return Err(e);
            }
        };

        // 从盘尾向下扫文件项重建名字树，跳过删除栈里的槽位。
        // 盘上项不保证父先于子，先占位后补全。
        let mut tree: BTreeMap<String, Arc<NodeCell>> = BTreeMap::new();
        let mut buf = dev.page_alloc(ioc, FILE_PC as u32);
        assert!(buf.pages() as u64 >= FILE_PC, "cannot allocate entry pages");
        let mut pa = alloc.header().pagecount - FILE_PC;
        let mut loaded = 0u64;
        let mut bad = None;
        while loaded < fdcount {
            if delstack.contains(&pa) {
                log::debug!("scan skip {pa:#x}");
                pa -= FILE_PC;
                continue;
            }
            dev.read(ioc, &mut buf.as_bytes_mut()[..], pa, FILE_PC as u32);
            if let Err(e) = insert_entry(&mut tree, &buf) {
                bad = Some(e);
                break;
            }
            loaded += 1;
            pa -= FILE_PC;
        }
        dev.page_free(ioc, buf);
        dev.ioc_free(ioc);
        if let Some(e) = bad {
            return Err(e);
        }

        // 占位的目录必须全部被真实项补全
        for (name, cell) in &tree {
            if cell.state.read().unwrap().pageid == 0 {
                log::error!("directory {name} has no entry on disk");
                return Err(FsError::InvalidArgument);
            }
        }
        if !tree.contains_key("/") {
            log::error!("root directory missing");
            return Err(FsError::InvalidArgument);
        }

        Ok(Self {
            dev,
            inner: Arc::new(RwLock::new(Core { alloc, tree })),
            fsid,
        })
    }

    /// 读入并校验头部与位图
    fn load(dev: &dyn PageDevice, ioc: Ioc) -> Result<(Allocator, u64, Vec<u64>)> {
        let geo = dev.geometry();
        let pagecount = geo.pagecount;
        let datapage = HeaderBuf::datapage_for(pagecount);
        if pagecount <= datapage + 2 * FILE_PC {
            log::error!("device too small ({pagecount} pages)");
            return Err(FsError::Io);
        }
        let mut hb = HeaderBuf::new(datapage);
        dev.read(ioc, hb.as_bytes_mut(), 0, datapage as u32);

        let alloc = Allocator::new(hb);
        let popcount = alloc.count_used();
        let hdr = alloc.header();
        if !hdr.validate(pagecount, datapage, popcount) {
            log::error!("bad UNFS header\n{hdr}");
            return Err(FsError::InvalidArgument);
        }
        let fdcount = hdr.fdcount;
        let delstack = hdr.delstack[..hdr.delcount as usize].to_vec();
        Ok((alloc, fdcount, delstack))
    }

    /// 每次打开现生成的实例标识
    pub fn fsid(&self) -> u64 {
        self.fsid
    }

    /// 头部信息快照
    pub fn stat(&self) -> Header {
        self.inner.read().unwrap().alloc.header().clone()
    }

    /// 名字存在即返回（是否目录，大小）；目录大小是子节点数
    pub fn exist(&self, name: &str) -> Option<(bool, u64)> {
        let core = self.inner.read().unwrap();
        let cell = core.tree.get(name)?;
        let st = cell.state.read().unwrap();
        Some((st.isdir, st.size))
    }

    /// 列出目录的直接子节点，顺序不作保证
    pub fn dir_list(&self, name: &str) -> Result<Vec<DirEntry>> {
        log::debug!("dir_list {name}");
        let core = self.inner.read().unwrap();
        let cell = core.tree.get(name).ok_or(FsError::NotFound)?;
        let count = {
            let st = cell.state.read().unwrap();
            if !st.isdir {
                return Err(FsError::NotFound);
            }
            st.size
        };
        let mut list = Vec::with_capacity(count as usize);
        let bounds = (Bound::<&str>::Excluded(name), Bound::Unbounded);
        for (cname, ccell) in core.tree.range::<str, _>(bounds) {
            if !cname.starts_with(name) {
                break;
            }
            if child_of(cname, name) {
                let st = ccell.state.read().unwrap();
                list.push(DirEntry {
                    name: cname.clone(),
                    size: st.size,
                    isdir: st.isdir,
                });
            }
        }
        assert_eq!(count as usize, list.len(), "bad directory size for {name}");
        Ok(list)
    }

    /// 创建文件或目录，已存在视为成功；
    /// `parents` 置位时逐级补全缺失的中间目录。
    pub fn create(&self, name: &str, isdir: bool, parents: bool) -> Result<()> {
        log::debug!("create {name} isdir={isdir}");
        if !name_valid(name) {
            return Err(FsError::InvalidArgument);
        }
        let mut core = self.inner.write().unwrap();
        if parents {
            let mut pos = 1;
            loop {
                let (path, dir, last) = match name[pos..].find('/') {
                    Some(i) => (&name[..pos + i], true, false),
                    None => (name, isdir, true),
                };
                if !core.tree.contains_key(path) {
                    self.node_create(&mut core, path, dir)?;
                }
                if last {
                    break;
                }
                pos = path.len() + 1;
            }
        } else if !core.tree.contains_key(name) {
            self.node_create(&mut core, name, isdir)?;
        }
        Ok(())
    }

    /// 删除文件或空目录
    pub fn remove(&self, name: &str, isdir: bool) -> Result<()> {
        log::debug!("remove {name}");
        if name == "/" || !name_valid(name) {
            return Err(FsError::InvalidArgument);
        }
        let mut core = self.inner.write().unwrap();
        let cell = core.tree.get(name).cloned().ok_or(FsError::NotFound)?;
        {
            let st = cell.state.read().unwrap();
            if st.isdir != isdir {
                return Err(FsError::NotFound);
            }
            if st.open > 0 || (isdir && st.size != 0) {
                return Err(FsError::Busy);
            }
        }
        let ioc = self.dev.ioc_alloc();
        self.node_remove(&mut core, &cell, ioc);
        self.dev.ioc_free(ioc);
        Ok(())
    }

    /// 改名或移动。源不能被打开；目录还必须为空，因为所有
    /// 子孙的名字都内嵌完整路径。`replace` 置位时覆盖同名目标。
    pub fn rename(&self, src: &str, dst: &str, replace: bool) -> Result<()> {
        log::debug!("rename {src} to {dst}");
        if src == "/" || dst == "/" || !name_valid(src) || !name_valid(dst) {
            return Err(FsError::InvalidArgument);
        }
        if src == dst {
            return Ok(());
        }
        // 目标落在源自身下面会把节点挂成自己的孩子
        if dst.len() > src.len() && dst.starts_with(src) && dst.as_bytes()[src.len()] == b'/' {
            return Err(FsError::InvalidArgument);
        }
        let mut core = self.inner.write().unwrap();
        let ioc = self.dev.ioc_alloc();
        let res = self.do_rename(&mut core, ioc, src, dst, replace);
        self.dev.ioc_free(ioc);
        res
    }

    fn do_rename(
        &self,
        core: &mut Core,
        ioc: Ioc,
        src: &str,
        dst: &str,
        replace: bool,
    ) -> Result<()> {
        let srccell = core.tree.get(src).cloned().ok_or(FsError::NotFound)?;
        {
            let s = srccell.state.read().unwrap();
            if s.open > 0 || (s.isdir && s.size != 0) {
                return Err(FsError::Busy);
            }
        }
        let dstparent = core
            .tree
            .get(parent_name(dst))
            .cloned()
            .ok_or(FsError::InvalidArgument)?;
        if !dstparent.state.read().unwrap().isdir {
            return Err(FsError::InvalidArgument);
        }

        if let Some(dstcell) = core.tree.get(dst).cloned() {
            if !replace {
                return Err(FsError::AlreadyExists);
            }
            {
                let d = dstcell.state.read().unwrap();
                if d.open > 0 || (d.isdir && d.size != 0) {
                    return Err(FsError::Busy);
                }
            }
            self.node_remove(core, &dstcell, ioc);
        }

        // 换键重插，父目录计数各自增减并落盘
        let srcparent = core
            .tree
            .get(parent_name(src))
            .cloned()
            .expect("source parent in tree");
        core.tree.remove(src);
        {
            let mut s = srccell.state.write().unwrap();
            s.name = dst.to_string();
            s.parentid = dstparent.state.read().unwrap().pageid;
            s.sync(&*self.dev, ioc);
        }
        core.tree.insert(dst.to_string(), srccell);
        if !Arc::ptr_eq(&srcparent, &dstparent) {
            {
                let mut p = srcparent.state.write().unwrap();
                p.size -= 1;
                p.sync(&*self.dev, ioc);
            }
            let mut p = dstparent.state.write().unwrap();
            p.size += 1;
            p.sync(&*self.dev, ioc);
        }
        Ok(())
    }

    /// 打开文件；`CREATE` 缺省要求文件已存在，`EXCLUSIVE`
    /// 对已打开的节点返回忙。
    pub fn file_open(&self, name: &str, mode: BitFlags<OpenMode>) -> Result<File> {
        log::debug!("file_open {name} mode={mode:?}");
        if name == "/" || !name_valid(name) {
            return Err(FsError::InvalidArgument);
        }
        let cell = if mode.contains(OpenMode::Create) {
            let mut core = self.inner.write().unwrap();
            let cell = match core.tree.get(name).cloned() {
                Some(c) => c,
                None => self.node_create(&mut core, name, false)?,
            };
            open_node(&cell, mode)?;
            cell
        } else {
            let core = self.inner.read().unwrap();
            let cell = core.tree.get(name).cloned().ok_or(FsError::NotFound)?;
            open_node(&cell, mode)?;
            cell
        };
        Ok(File::new(
            self.dev.clone(),
            self.inner.clone(),
            cell,
            mode,
        ))
    }

    /// 把头部与位图的脏范围写回设备
    pub fn sync(&self) {
        let mut core = self.inner.write().unwrap();
        let ioc = self.dev.ioc_alloc();
        core.alloc.sync(&*self.dev, ioc);
        self.dev.ioc_free(ioc);
    }

    fn node_create(&self, core: &mut Core, name: &str, isdir: bool) -> Result<Arc<NodeCell>> {
        log::debug!("node create {name}");
        let parent = core
            .tree
            .get(parent_name(name))
            .cloned()
            .ok_or(FsError::NotFound)?;
        let parentid = {
            let p = parent.state.read().unwrap();
            if !p.isdir {
                return Err(FsError::InvalidArgument);
            }
            p.pageid
        };
        let pageid = core.alloc.fd_alloc(isdir).ok_or(FsError::NoSpace)?;
        let cell = Arc::new(NodeCell::new(NodeState {
            name: name.to_string(),
            pageid,
            parentid,
            size: 0,
            isdir,
            ds: Vec::new(),
            open: 0,
            updated: false,
        }));
        core.tree.insert(name.to_string(), cell.clone());

        let ioc = self.dev.ioc_alloc();
        {
            let mut p = parent.state.write().unwrap();
            p.size += 1;
            p.sync(&*self.dev, ioc);
        }
        cell.state.read().unwrap().sync(&*self.dev, ioc);
        self.dev.ioc_free(ioc);
        Ok(cell)
    }

    /// 摘除节点：归还数据段与槽位，父目录计数减一。
    /// 删除栈溢出时把 `fdnextpage` 处的项搬进腾出的槽位，
    /// 搬的是目录还要把指着旧槽位的孩子逐个改写。
    fn node_remove(&self, core: &mut Core, cell: &Arc<NodeCell>, ioc: Ioc) {
        let dev = &*self.dev;
        let mut st = cell.state.write().unwrap();
        log::debug!("node remove {} {:#x}", st.name, st.pageid);
        core.tree.remove(&st.name);
        let parent = core
            .tree
            .get(parent_name(&st.name))
            .cloned()
            .expect("parent in tree");
        {
            let mut p = parent.state.write().unwrap();
            p.size -= 1;
            p.sync(dev, ioc);
        }

        if !st.isdir {
            for ds in std::mem::take(&mut st.ds) {
                core.alloc.free(ds.pageid, ds.pagecount);
            }
        }

        if core.alloc.fd_free(st.pageid, st.isdir) {
            log::info!("delete stack is full, {} slot is reused", st.name);
            let fdpage = core.alloc.header().fdnextpage;
            let mut buf = dev.page_alloc(ioc, FILE_PC as u32);
            assert!(buf.pages() as u64 >= FILE_PC, "cannot allocate entry pages");
            dev.read(ioc, &mut buf.as_bytes_mut()[..], fdpage, FILE_PC as u32);
            let moved_name = entry_name(&buf, 0)
                .unwrap_or_else(|| panic!("entry {fdpage:#x} has no name"))
                .to_string();
            dev.page_free(ioc, buf);

            let moved = core
                .tree
                .get(&moved_name)
                .cloned()
                .unwrap_or_else(|| panic!("{moved_name} not in tree"));
            let (oldpage, moved_isdir) = {
                let mut m = moved.state.write().unwrap();
                let oldpage = m.pageid;
                m.pageid = st.pageid;
                m.sync(dev, ioc);
                (oldpage, m.isdir)
            };
            if moved_isdir {
                // 只改写 parentid 还指着旧槽位的孩子
                for c in core.tree.values() {
                    if Arc::ptr_eq(c, &moved) {
                        continue;
                    }
                    let mut cs = c.state.write().unwrap();
                    if cs.parentid == oldpage {
                        cs.parentid = st.pageid;
                        cs.sync(dev, ioc);
                    }
                }
            }
        }
    }

    /// 格式化：写出只含根目录的空文件系统，返回头部快照
    pub fn format(device: &str, label: &str) -> Result<Header> {
        log::debug!("format {device}");
        if label.len() > 63 {
            return Err(FsError::InvalidArgument);
        }
        let dev = open_dev(device)?;
        let geo = dev.geometry();
        let pagecount = geo.pagecount;
        let datapage = HeaderBuf::datapage_for(pagecount);
        if pagecount <= datapage + 2 * FILE_PC {
            log::error!("device too small ({pagecount} pages)");
            return Err(FsError::Io);
        }

        let mut hb = HeaderBuf::new(datapage);
        {
            let hdr = hb.header_mut();
            hdr.label[..label.len()].copy_from_slice(label.as_bytes());
            hdr.version[..VERSION.len()].copy_from_slice(VERSION.as_bytes());
            hdr.blockcount = geo.blockcount;
            hdr.blocksize = geo.blocksize;
            hdr.pagecount = pagecount;
            hdr.pagesize = PAGE_SIZE as u32;
            hdr.pagefree = pagecount - datapage;
            hdr.datapage = datapage;
            hdr.fdnextpage = pagecount - FILE_PC;
            hdr.mapsize = (pagecount - datapage).div_ceil(64);
            hdr.delmax = crate::layout::DELSTACK_MAX as u32;
        }

        let mut alloc = Allocator::new(hb);
        let rootpage = alloc.fd_alloc(true).ok_or(FsError::NoSpace)?;
        let root = NodeState::new_dir("/", rootpage, 0, 0);

        let ioc = dev.ioc_alloc();
        root.sync(&*dev, ioc);
        dev.write(ioc, alloc.hb().as_bytes(), 0, datapage as u32);
        dev.ioc_free(ioc);
        Ok(alloc.header().clone())
    }

    /// 只读校验整个盘面：头部算术、重数空闲页、每个项的槽位与
    /// 数据段都在位图里置位、删除栈槽位清零、父项名确为前缀。
    pub fn check(device: &str) -> Result<()> {
        log::debug!("check {device}");
        let dev = open_dev(device)?;
        let ioc = dev.ioc_alloc();
        let res = Self::do_check(&*dev, ioc);
        dev.ioc_free(ioc);
        res
    }

    fn do_check(dev: &dyn PageDevice, ioc: Ioc) -> Result<()> {
        let (alloc, fdcount, delstack) = Self::load(dev, ioc)?;

        for &pa in &delstack {
            if !alloc.check_clear(pa, FILE_PC) {
                log::error!("deleted slot {pa:#x} still marked in bitmap");
                return Err(FsError::InvalidArgument);
            }
        }

        // 一块缓冲装下当前项与其父项
        let mut buf = dev.page_alloc(ioc, 2 * FILE_PC as u32);
        assert!(
            buf.pages() as u64 >= 2 * FILE_PC,
            "cannot allocate entry pages"
        );

        let mut pa = alloc.header().pagecount - FILE_PC;
        let mut loaded = 0u64;
        let mut bad = None;
        while loaded < fdcount {
            if delstack.contains(&pa) {
                pa -= FILE_PC;
                continue;
            }
            if let Err(e) = check_entry(dev, ioc, &alloc, &mut buf, pa) {
                bad = Some(e);
                break;
            }
            loaded += 1;
            pa -= FILE_PC;
        }
        dev.page_free(ioc, buf);
        match bad {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Unfs {
    /// 在内存里核对全部不变式，测试挂在每步操作之后；
    /// 破坏即 panic。
    pub fn verify(&self) {
        let core = self.inner.read().unwrap();
        let hdr = core.alloc.header();
        assert!(hdr.fd_equation_holds(), "file entry region equation broken");
        assert_eq!(
            core.alloc.count_used() + hdr.pagefree + hdr.datapage,
            hdr.pagecount,
            "bitmap accounting broken"
        );
        for &pa in &hdr.delstack[..hdr.delcount as usize] {
            assert!(
                core.alloc.check_clear(pa, FILE_PC),
                "deleted slot {pa:#x} still marked"
            );
        }

        let mut segs: Vec<(u64, u64, &str)> = Vec::new();
        let mut fdcount = 0u64;
        let mut dircount = 0u64;
        for (name, cell) in &core.tree {
            let st = cell.state.read().unwrap();
            fdcount += 1;
            assert!(
                core.alloc.check_set(st.pageid, FILE_PC),
                "{name} slot {:#x} bits not set",
                st.pageid
            );
            if st.isdir {
                dircount += 1;
                let children = core
                    .tree
                    .iter()
                    .filter(|(c, _)| child_of(c, name))
                    .count() as u64;
                assert_eq!(st.size, children, "{name} child count mismatch");
            } else {
                let mut pages = 0;
                for ds in &st.ds {
                    assert!(
                        core.alloc.check_set(ds.pageid, ds.pagecount),
                        "{name} segment ({:#x} {:#x}) bits not set",
                        ds.pageid,
                        ds.pagecount
                    );
                    pages += ds.pagecount;
                    segs.push((ds.pageid, ds.pagecount, name.as_str()));
                }
                assert_eq!(crate::page_count(st.size), pages, "{name} segment total");
            }
            if name != "/" {
                let parent = core.tree.get(parent_name(name)).unwrap_or_else(|| {
                    panic!("{name} has no parent node");
                });
                let p = parent.state.read().unwrap();
                assert!(child_of(name, &p.name));
                assert_eq!(st.parentid, p.pageid, "{name} parentid stale");
            }
        }
        assert_eq!(hdr.fdcount, fdcount, "fdcount mismatch");
        assert_eq!(hdr.dircount, dircount, "dircount mismatch");

        segs.sort_unstable();
        for w in segs.windows(2) {
            let ((a, ac, an), (b, _, bn)) = (w[0], w[1]);
            assert!(a + ac <= b, "segments of {an} and {bn} overlap");
        }
    }
}

impl Drop for Unfs {
    // 关闭即同步头部与位图
    fn drop(&mut self) {
        // 已经带着毒的锁说明进程在崩溃路上，不再碰设备
        let Ok(mut core) = self.inner.write() else {
            return;
        };
        let ioc = self.dev.ioc_alloc();
        core.alloc.sync(&*self.dev, ioc);
        self.dev.ioc_free(ioc);
    }
}

/// 校验一条盘上项：槽位与数据段的位、父项名前缀
fn check_entry(
    dev: &dyn PageDevice,
    ioc: Ioc,
    alloc: &Allocator,
    buf: &mut PageBuf,
    pa: u64,
) -> Result<()> {
    let hdr = alloc.header();
    let (pagecount, fdnextpage) = (hdr.pagecount, hdr.fdnextpage);
    let parent_off = (FILE_PC as usize) * PAGE_SIZE;

    dev.read(ioc, &mut buf.as_bytes_mut()[..parent_off], pa, FILE_PC as u32);
    let (pageid, parentid, dscount) = {
        let rec: &DiskNode = buf.get(0);
        (rec.pageid, rec.parentid, rec.dscount as usize)
    };
    let Some(name) = entry_name(buf, 0) else {
        log::error!("entry {pa:#x} has a corrupt name page");
        return Err(FsError::InvalidArgument);
    };
    log::debug!("check scan {pa:#x} {name}");

    if !alloc.check_set(pageid, FILE_PC) {
        log::error!("{name} slot {pageid:#x} bits not set");
        return Err(FsError::InvalidArgument);
    }
    if dscount > crate::MAX_DS {
        log::error!("{name} has impossible segment count {dscount}");
        return Err(FsError::InvalidArgument);
    }
    let rec: &DiskNode = buf.get(0);
    for (i, ds) in rec.ds[..dscount].iter().enumerate() {
        if !alloc.check_set(ds.pageid, ds.pagecount) {
            log::error!(
                "{name} ds[{i}]=({:#x} {:#x}) bits not set",
                ds.pageid,
                ds.pagecount
            );
            return Err(FsError::InvalidArgument);
        }
    }

    if name != "/" {
        if parentid <= fdnextpage || parentid >= pagecount {
            log::error!("{name} has bad parentid {parentid:#x}");
            return Err(FsError::InvalidArgument);
        }
        dev.read(
            ioc,
            &mut buf.as_bytes_mut()[parent_off..],
            parentid,
            FILE_PC as u32,
        );
        let name = entry_name(buf, 0).unwrap();
        match entry_name(buf, parent_off) {
            Some(pname) if child_of(name, pname) => {}
            _ => {
                log::error!("{name} is not a child of its parent entry");
                return Err(FsError::InvalidArgument);
            }
        }
    }
    Ok(())
}

fn open_dev(device: &str) -> Result<Arc<dyn PageDevice>> {
    page_dev::open_device(device).map_err(|e| {
        log::error!("open {device}: {e}");
        FsError::Io
    })
}

fn open_node(cell: &Arc<NodeCell>, mode: BitFlags<OpenMode>) -> Result<()> {
    let mut st = cell.state.write().unwrap();
    if st.isdir {
        return Err(FsError::InvalidArgument);
    }
    if mode.contains(OpenMode::Exclusive) && st.open > 0 {
        return Err(FsError::Busy);
    }
    st.open += 1;
    Ok(())
}

/// 扫描期间把一条盘上项并进名字树
fn insert_entry(tree: &mut BTreeMap<String, Arc<NodeCell>>, buf: &PageBuf) -> Result<()> {
    let rec: &DiskNode = buf.get(0);
    let Some(name) = entry_name(buf, 0) else {
        log::error!("entry {:#x} has a corrupt name page", rec.pageid);
        return Err(FsError::InvalidArgument);
    };
    if !name_valid(name) {
        log::error!("entry {:#x} has invalid name {name:?}", rec.pageid);
        return Err(FsError::InvalidArgument);
    }
    log::debug!("scan {:#x} {name}", rec.pageid);

    if let Some(cell) = tree.get(name) {
        // 先被孩子占位的目录，补上真实内容
        let mut st = cell.state.write().unwrap();
        assert!(
            st.isdir && st.pageid == 0,
            "{name} loaded at {:#x} seen again at {:#x}",
            st.pageid,
            rec.pageid
        );
        assert!(rec.isdir != 0, "{name} expected to be a directory");
        st.pageid = rec.pageid;
        st.parentid = rec.parentid;
        st.size = rec.size;
        return Ok(());
    }

    if name != "/" {
        add_parents(tree, name);
        let parent = tree.get(parent_name(name)).expect("parent just added");
        let p = parent.state.read().unwrap();
        assert!(
            child_of(name, &p.name),
            "{} is not the parent of {name}",
            p.name
        );
        assert!(
            p.pageid == 0 || rec.parentid == p.pageid,
            "{name} parentid {:#x} does not match {} at {:#x}",
            rec.parentid,
            p.name,
            p.pageid
        );
    }
    let isdir = rec.isdir != 0;
    if !isdir && rec.dscount as usize > crate::MAX_DS {
        log::error!("{name} has impossible segment count {}", rec.dscount);
        return Err(FsError::InvalidArgument);
    }
    let ds = if isdir {
        Vec::new()
    } else {
        rec.ds[..rec.dscount as usize].to_vec()
    };
    tree.insert(
        name.to_string(),
        Arc::new(NodeCell::new(NodeState {
            name: name.to_string(),
            pageid: rec.pageid,
            parentid: rec.parentid,
            size: rec.size,
            isdir,
            ds,
            open: 0,
            updated: false,
        })),
    );
    Ok(())
}

/// 为 `name` 的每级缺失前缀插入占位目录（pageid 0），
/// 等对应的真实项扫到再补全
fn add_parents(tree: &mut BTreeMap<String, Arc<NodeCell>>, name: &str) {
    let mut idx = 1;
    while let Some(pos) = name[idx..].find('/') {
        let end = idx + pos;
        let path = &name[..end];
        if !tree.contains_key(path) {
            tree.insert(
                path.to_string(),
                Arc::new(NodeCell::new(NodeState::new_dir(path, 0, 0, 0))),
            );
        }
        idx = end + 1;
    }
}

/// 名字规则：以 `/` 开头、不以 `/` 结尾（根除外），
/// 组件非空且全为可打印字符
pub(crate) fn name_valid(name: &str) -> bool {
    if !name.starts_with('/') || name.len() >= MAX_PATH {
        return false;
    }
    if name == "/" {
        return true;
    }
    if name.ends_with('/') {
        return false;
    }
    name[1..].split('/').all(|comp| {
        !comp.is_empty() && comp.bytes().all(|b| b == b' ' || b.is_ascii_graphic())
    })
}

/// `child` 是否为 `parent` 的直接子节点：父名是真前缀，
/// 紧跟一个 `/`，其后不再出现 `/`
pub(crate) fn child_of(child: &str, parent: &str) -> bool {
    if child.len() <= parent.len() {
        return false;
    }
    if parent == "/" {
        return !child[1..].contains('/');
    }
    let (head, tail) = child.split_at(parent.len());
    head == parent && tail.starts_with('/') && !tail[1..].contains('/')
}

/// 上一级目录名；根的父还是根
pub(crate) fn parent_name(name: &str) -> &str {
    match name.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &name[..idx],
    }
}
