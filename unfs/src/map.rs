//! 空闲页位图分配器
//!
//! 一张位图同时服务两类分配：变长的数据段从 `datapage` 向上找
//! 最低首个适配的连续游程；定长两页的文件项槽从 `fdnextpage`
//! 向下取，或直接弹删除栈。字内按最高位在前记位，
//! word `i` 的最高位对应页 `datapage + 64 * i`。
//!
//! 位图只在内存里改，按数据区、文件项区各自的脏范围记账，
//! 同步时写头部加上盖住脏范围的最小页跨度。

use page_dev::{Ioc, PageDevice, PAGE_SHIFT};

use crate::layout::{Header, HeaderBuf};
use crate::{FILE_PC, MAP_PA};

/// 一页位图管的页数的移位值
const MAP_PAGE_SHIFT: u32 = PAGE_SHIFT + 3;

/// 待写回的页地址闭开区间
#[derive(Debug, Clone, Copy)]
struct DirtyRange {
    lo: u64,
    hi: u64,
}

impl DirtyRange {
    fn empty(pagecount: u64) -> Self {
        Self { lo: pagecount, hi: 0 }
    }

    fn expand(&mut self, lo: u64, hi: u64) {
        if self.lo > lo {
            self.lo = lo;
        }
        if self.hi < hi {
            self.hi = hi;
        }
    }

    fn take(&mut self, pagecount: u64) -> Option<(u64, u64)> {
        let r = (self.lo < self.hi).then_some((self.lo, self.hi));
        *self = Self::empty(pagecount);
        r
    }
}

pub(crate) struct Allocator {
    hb: HeaderBuf,
    /// 下次数据搜索的起始字下标
    mapnext: u64,
    data_dirty: DirtyRange,
    fd_dirty: DirtyRange,
}

impl Allocator {
    pub fn new(hb: HeaderBuf) -> Self {
        let pagecount = hb.header().pagecount;
        let mapsize = hb.header().mapsize;
        let mapnext = hb
            .map()
            .iter()
            .take(mapsize as usize)
            .position(|&w| w != u64::MAX)
            .unwrap_or(mapsize as usize) as u64;
        Self {
            hb,
            mapnext,
            data_dirty: DirtyRange::empty(pagecount),
            fd_dirty: DirtyRange::empty(pagecount),
        }
    }

    #[inline]
    pub fn header(&self) -> &Header {
        self.hb.header()
    }

    #[inline]
    pub fn hb(&self) -> &HeaderBuf {
        &self.hb
    }

    /// 数出整张位图的置位数
    pub fn count_used(&self) -> u64 {
        let mapsize = self.hb.header().mapsize as usize;
        self.hb.map()[..mapsize]
            .iter()
            .map(|w| w.count_ones() as u64)
            .sum()
    }

    /// 指定页区间的位是否全部置位
    pub fn check_set(&self, pageid: u64, pagecount: u64) -> bool {
        let hdr = self.hb.header();
        if pageid < hdr.datapage || pageid + pagecount > hdr.pagecount {
            return false;
        }
        let map = self.hb.map();
        (pageid..pageid + pagecount).all(|p| {
            let pa = p - hdr.datapage;
            map[(pa >> 6) as usize] & (1 << (63 - (pa & 63))) != 0
        })
    }

    /// 指定页区间的位是否全部清零
    pub fn check_clear(&self, pageid: u64, pagecount: u64) -> bool {
        let hdr = self.hb.header();
        if pageid < hdr.datapage || pageid + pagecount > hdr.pagecount {
            return false;
        }
        let map = self.hb.map();
        (pageid..pageid + pagecount).all(|p| {
            let pa = p - hdr.datapage;
            map[(pa >> 6) as usize] & (1 << (63 - (pa & 63))) == 0
        })
    }

    /// 分配一段连续空闲页，返回页地址；空间不足返回 `None`，
    /// 此时位图与头部都不动。
    pub fn alloc(&mut self, pagecount: u64) -> Option<u64> {
        log::debug!("map alloc {pagecount}");
        debug_assert!(pagecount > 0);
        let hdr = self.hb.header();
        let (datapage, mapsize) = (hdr.datapage, hdr.mapsize);
        // 搜索不进入文件项区的字，也永远不碰最后一个字
        let guard = ((hdr.fdcount + hdr.delcount as u64) >> 5) + 1;
        let mapend = mapsize.saturating_sub(guard);

        let found = if pagecount < 64 {
            self.find_in_word(mapend, pagecount as u32)
        } else {
            self.find_words(mapend, pagecount)
        };
        let (wi, bit) = found?;

        set_run(self.hb.map_mut(), wi, bit, pagecount);
        let hdr = self.hb.header_mut();
        hdr.pagefree -= pagecount;
        let pageid = hdr.datapage + (wi << 6) + bit as u64;
        self.mapnext = wi;
        self.data_dirty.expand(pageid, pageid + pagecount);
        Some(pageid)
    }

    /// 字内找零游程：从最高位往低扫，返回首个容得下 `want` 的位置
    fn find_in_word(&self, mapend: u64, want: u32) -> Option<(u64, u32)> {
        let map = self.hb.map();
        for wi in self.mapnext..mapend {
            let word = map[wi as usize];
            if word == u64::MAX {
                continue;
            }
            let mut bit = 0u32;
            while bit < 64 {
                let w = word << bit;
                if w == 0 {
                    // 剩余全零
                    if 64 - bit >= want {
                        return Some((wi, bit));
                    }
                    break;
                }
                let run = w.leading_zeros();
                if run >= want {
                    return Some((wi, bit));
                }
                if run > 0 {
                    // 零游程不够长，跳过它
                    bit += run;
                    continue;
                }
                // 当前位已占用，跳过这串置位
                bit += (!w).leading_zeros();
            }
        }
        None
    }

    /// 跨字找全零字游程，尾部的零头位在标记时收口
    fn find_words(&self, mapend: u64, pagecount: u64) -> Option<(u64, u32)> {
        let map = self.hb.map();
        let nwords = pagecount.div_ceil(64);
        let mut run = 0u64;
        let mut start = 0u64;
        for wi in self.mapnext..mapend {
            if map[wi as usize] != 0 {
                run = 0;
                continue;
            }
            if run == 0 {
                start = wi;
            }
            run += 1;
            if run == nwords {
                return Some((start, 0));
            }
        }
        None
    }

    /// 归还一段页。段可能由多次分配拼成，按任意对齐逐字清位；
    /// 清到没置位的位说明早已损坏，直接终止。
    pub fn free(&mut self, pageid: u64, pagecount: u64) {
        log::debug!("map free {pageid:#x} {pagecount}");
        let datapage = self.hb.header().datapage;
        let pa = pageid - datapage;
        if self.mapnext > pa >> 6 {
            self.mapnext = pa >> 6;
        }
        clear_run(self.hb.map_mut(), pa >> 6, (pa & 63) as u32, pagecount);
        self.hb.header_mut().pagefree += pagecount;
        self.data_dirty.expand(pageid, pageid + pagecount);
    }

    /// 要一个文件项槽：先弹删除栈，栈空则把 `fdnextpage` 下移两页
    pub fn fd_alloc(&mut self, isdir: bool) -> Option<u64> {
        let fdpage;
        if self.hb.header().delcount > 0 {
            let hdr = self.hb.header_mut();
            hdr.delcount -= 1;
            fdpage = hdr.delstack[hdr.delcount as usize];
            // 栈里的槽位在位图里是清零的，取用时重新置位
            let pa = fdpage - hdr.datapage;
            set_run(self.hb.map_mut(), pa >> 6, (pa & 63) as u32, FILE_PC);
            self.hb.header_mut().pagefree -= FILE_PC;
        } else {
            let hdr = self.hb.header();
            fdpage = hdr.fdnextpage;
            if fdpage < hdr.datapage + FILE_PC {
                return None;
            }
            if !self.check_clear(fdpage, FILE_PC) {
                // 数据区长进了文件项区，等同盘满
                log::error!("cannot allocate space for a new file entry");
                return None;
            }
            let pa = fdpage - hdr.datapage;
            set_run(self.hb.map_mut(), pa >> 6, (pa & 63) as u32, FILE_PC);
            let hdr = self.hb.header_mut();
            hdr.pagefree -= FILE_PC;
            hdr.fdnextpage -= FILE_PC;
        }
        self.fd_dirty.expand(fdpage, fdpage + FILE_PC);
        let hdr = self.hb.header_mut();
        hdr.fdcount += 1;
        if isdir {
            hdr.dircount += 1;
        }
        Some(fdpage)
    }

    /// 归还一个文件项槽。栈没满就入栈；满了就把 `fdnextpage` 回抬
    /// 两页，返回 `true` 表示腾出的槽位另有占用者等着搬家。
    /// 回抬后的边界槽若本就在栈里躺着，就地换成新腾的槽位即可，
    /// 不需要搬任何项。
    pub fn fd_free(&mut self, pageid: u64, isdir: bool) -> bool {
        let mut pending = false;
        let hdr = self.hb.header_mut();
        if hdr.delcount < hdr.delmax {
            hdr.delstack[hdr.delcount as usize] = pageid;
            hdr.delcount += 1;
            // 入栈即视作空闲页
            let pa = pageid - hdr.datapage;
            clear_run(self.hb.map_mut(), pa >> 6, (pa & 63) as u32, FILE_PC);
            self.hb.header_mut().pagefree += FILE_PC;
            self.fd_dirty.expand(pageid, pageid + FILE_PC);
        } else {
            hdr.fdnextpage += FILE_PC;
            hdr.pagefree += FILE_PC;
            let fdpage = hdr.fdnextpage;
            let delcount = hdr.delcount as usize;
            if let Some(i) = hdr.delstack[..delcount].iter().position(|&p| p == fdpage) {
                // 边界槽是栈里的空槽，已越过边界不必再记；
                // 腾出来的槽位顶替它入栈
                hdr.delstack[i] = pageid;
                let pa = pageid - hdr.datapage;
                clear_run(self.hb.map_mut(), pa >> 6, (pa & 63) as u32, FILE_PC);
                self.fd_dirty.expand(pageid, pageid + FILE_PC);
            } else {
                if pageid != fdpage {
                    pending = true;
                }
                let pa = fdpage - hdr.datapage;
                clear_run(self.hb.map_mut(), pa >> 6, (pa & 63) as u32, FILE_PC);
                self.fd_dirty.expand(fdpage, fdpage + FILE_PC);
            }
        }
        let hdr = self.hb.header_mut();
        hdr.fdcount -= 1;
        if isdir {
            hdr.dircount -= 1;
        }
        pending
    }

    /// 只写头部那两页
    pub fn write_header(&self, dev: &dyn PageDevice, ioc: Ioc) {
        dev.write(ioc, self.hb.head_bytes(), 0, crate::HEAD_PC as u32);
    }

    /// 写回头部，并把两个脏范围各自收口成最小页跨度写回位图
    pub fn sync(&mut self, dev: &dyn PageDevice, ioc: Ioc) {
        let (pagecount, datapage) = {
            let hdr = self.hb.header();
            (hdr.pagecount, hdr.datapage)
        };
        let data = self.data_dirty.take(pagecount);
        let fd = self.fd_dirty.take(pagecount);
        if data.is_none() && fd.is_none() {
            return;
        }
        self.write_header(dev, ioc);
        for (lo, hi) in [data, fd].into_iter().flatten() {
            let mp = (lo - datapage) >> MAP_PAGE_SHIFT;
            let pc = ((hi - 1 - datapage) >> MAP_PAGE_SHIFT) - mp + 1;
            dev.write(
                ioc,
                self.hb.map_page_bytes(mp, pc),
                MAP_PA + mp,
                pc as u32,
            );
        }
    }
}

/// 从最高位数第 `bit` 位起取连续 `n` 位的掩码，`bit + n <= 64`
#[inline]
fn mask_of(bit: u32, n: u64) -> u64 {
    let top = if n >= 64 { u64::MAX } else { !(u64::MAX >> n) };
    top >> bit
}

fn set_run(map: &mut [u64], mut wi: u64, mut bit: u32, mut count: u64) {
    while count > 0 {
        let n = ((64 - bit) as u64).min(count);
        let mask = mask_of(bit, n);
        debug_assert_eq!(map[wi as usize] & mask, 0, "bits already set");
        map[wi as usize] |= mask;
        count -= n;
        wi += 1;
        bit = 0;
    }
}

fn clear_run(map: &mut [u64], mut wi: u64, mut bit: u32, mut count: u64) {
    let total = count;
    while count > 0 {
        let n = ((64 - bit) as u64).min(count);
        let mask = mask_of(bit, n);
        if map[wi as usize] & mask != mask {
            panic!(
                "free {total} pages: map[{wi:#x}]={:#018x} bits {bit}..{} not set",
                map[wi as usize],
                bit as u64 + n
            );
        }
        map[wi as usize] &= !mask;
        count -= n;
        wi += 1;
        bit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HeaderBuf;
    use crate::VERSION;

    fn test_alloc(pagecount: u64) -> Allocator {
        let datapage = HeaderBuf::datapage_for(pagecount);
        let mut hb = HeaderBuf::new(datapage);
        let hdr = hb.header_mut();
        hdr.version[..VERSION.len()].copy_from_slice(VERSION.as_bytes());
        hdr.pagecount = pagecount;
        hdr.datapage = datapage;
        hdr.pagefree = pagecount - datapage;
        hdr.fdnextpage = pagecount - FILE_PC;
        hdr.mapsize = (pagecount - datapage).div_ceil(64);
        hdr.delmax = crate::layout::DELSTACK_MAX as u32;
        Allocator::new(hb)
    }

    #[test]
    fn alloc_lowest_first() {
        let mut a = test_alloc(4096);
        let dp = a.header().datapage;
        assert_eq!(Some(dp), a.alloc(3));
        assert_eq!(Some(dp + 3), a.alloc(5));
        a.free(dp, 3);
        assert_eq!(Some(dp), a.alloc(2));
        // 首个适配而不是最佳适配
        assert_eq!(Some(dp + 8), a.alloc(2));
        assert_eq!(Some(dp + 2), a.alloc(1));
    }

    #[test]
    fn alloc_across_words() {
        let mut a = test_alloc(65536);
        let dp = a.header().datapage;
        let big = a.alloc(200).unwrap();
        assert_eq!(dp, big);
        let next = a.alloc(64).unwrap();
        // 大段按整字对齐起步
        assert_eq!(0, (next - dp) % 64);
        a.free(big, 200);
        a.free(next, 64);
        assert_eq!(a.header().pagefree, a.header().pagecount - dp);
        assert_eq!(0, a.count_used());
    }

    #[test]
    fn free_partial_ranges() {
        let mut a = test_alloc(65536);
        let pa = a.alloc(130).unwrap();
        // 一次分配可以拆成多次归还
        a.free(pa + 100, 30);
        a.free(pa, 64);
        a.free(pa + 64, 36);
        assert_eq!(0, a.count_used());
    }

    #[test]
    #[should_panic(expected = "not set")]
    fn double_free_aborts() {
        let mut a = test_alloc(4096);
        let pa = a.alloc(4).unwrap();
        a.free(pa, 4);
        a.free(pa, 4);
    }

    #[test]
    fn fd_slots() {
        let mut a = test_alloc(4096);
        let pc = a.header().pagecount;
        let first = a.fd_alloc(true).unwrap();
        assert_eq!(pc - FILE_PC, first);
        let second = a.fd_alloc(false).unwrap();
        assert_eq!(pc - 2 * FILE_PC, second);
        assert!(a.check_set(second, FILE_PC));

        assert!(!a.fd_free(second, false));
        assert_eq!(1, a.header().delcount);
        assert!(a.check_clear(second, FILE_PC));
        // 出栈复用同一个槽
        assert_eq!(Some(second), a.fd_alloc(false));
        assert!(a.check_set(second, FILE_PC));
    }

    #[test]
    fn no_space_leaves_state() {
        let mut a = test_alloc(4096);
        let free_before = a.header().pagefree;
        let used = a.count_used();
        assert_eq!(None, a.alloc(1 << 20));
        assert_eq!(free_before, a.header().pagefree);
        assert_eq!(used, a.count_used());
    }
}
