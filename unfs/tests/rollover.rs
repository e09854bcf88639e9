//! 删除栈满之后的槽位回收

mod common;

use common::TestDisk;
use unfs::{Unfs, FILE_PC};

/// 建满 delmax + 1 个文件再按创建顺序删光：最后一次删除
/// 回抬 `fdnextpage`，盘上只剩根，重开与校验都必须干净。
#[test]
fn rollover_in_creation_order() {
    let disk = TestDisk::new("rollover", 16 << 20);
    Unfs::format(&disk.device(), "rollover").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();
    let delmax = fs.stat().delmax as u64;

    for i in 0..=delmax {
        fs.create(&format!("/t{i}"), false, false).unwrap();
    }
    for i in 0..=delmax {
        fs.remove(&format!("/t{i}"), false).unwrap();
    }

    let stat = fs.stat();
    assert_eq!(1, stat.fdcount);
    assert_eq!(delmax, stat.delcount as u64);
    assert!(stat.fd_equation_holds());
    fs.verify();
    drop(fs);

    let fs = Unfs::open(&disk.device()).unwrap();
    assert_eq!(None, fs.exist("/t0"));
    assert_eq!(Some((true, 0)), fs.exist("/"));
    fs.verify();
    drop(fs);
    assert!(Unfs::check(&disk.device()).is_ok());
}

/// 溢出时边界槽自己就在栈里：不搬项，就地换栈
#[test]
fn rollover_vacant_boundary() {
    let disk = TestDisk::new("vacant", 16 << 20);
    Unfs::format(&disk.device(), "vacant").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();
    let delmax = fs.stat().delmax as u64;

    for i in 0..=delmax {
        fs.create(&format!("/t{i}"), false, false).unwrap();
    }
    // 先删低地址的 t1..，最后删最高的 t0；
    // 回抬后的边界槽正是 t 系列的空槽
    for i in 1..=delmax {
        fs.remove(&format!("/t{i}"), false).unwrap();
    }
    fs.remove("/t0", false).unwrap();

    let stat = fs.stat();
    assert_eq!(1, stat.fdcount);
    assert_eq!(delmax, stat.delcount as u64);
    assert!(stat.fd_equation_holds());
    fs.verify();
    drop(fs);
    assert!(Unfs::check(&disk.device()).is_ok());
}

/// 溢出时边界槽是活目录：目录搬进腾出的槽位，
/// 指着旧槽位的孩子全部改写
#[test]
fn rollover_relocates_directory() {
    let disk = TestDisk::new("reloc", 16 << 20);
    Unfs::format(&disk.device(), "reloc").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();
    let delmax = fs.stat().delmax as u64;

    // 两个垫脚文件把高处的槽位空出来，回收给 /d 的孩子，
    // 这样 /d 自己落在最低的活槽位上
    fs.create("/e1", false, false).unwrap();
    fs.create("/e2", false, false).unwrap();
    for i in 0..delmax {
        fs.create(&format!("/t{i}"), false, false).unwrap();
    }
    fs.create("/d", true, false).unwrap();
    fs.remove("/e1", false).unwrap();
    fs.remove("/e2", false).unwrap();
    fs.create("/d/a", false, false).unwrap();
    fs.create("/d/b", false, false).unwrap();

    for i in 0..delmax {
        fs.remove(&format!("/t{i}"), false).unwrap();
    }
    // 栈已满，这次删除迫使 /d 搬家
    fs.remove("/d/a", false).unwrap();

    assert_eq!(Some((true, 1)), fs.exist("/d"));
    assert_eq!(Some((false, 0)), fs.exist("/d/b"));
    fs.verify();
    drop(fs);

    // 重开走的是盘上数据，孩子的 parentid 必须指向新槽位
    let fs = Unfs::open(&disk.device()).unwrap();
    assert_eq!(Some((true, 1)), fs.exist("/d"));
    assert_eq!(Some((false, 0)), fs.exist("/d/b"));
    assert_eq!(
        vec!["/d/b".to_string()],
        fs.dir_list("/d")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect::<Vec<_>>()
    );
    fs.verify();
    drop(fs);
    assert!(Unfs::check(&disk.device()).is_ok());
}

/// 栈里的槽位被新建项回收复用
#[test]
fn deleted_slot_reuse() {
    let disk = TestDisk::new("reuse", 16 << 20);
    Unfs::format(&disk.device(), "reuse").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();

    fs.create("/a", false, false).unwrap();
    let fdnext_before = fs.stat().fdnextpage;
    fs.remove("/a", false).unwrap();
    assert_eq!(1, fs.stat().delcount);

    // 新建从栈顶拿槽，区域不再下探
    fs.create("/b", false, false).unwrap();
    let stat = fs.stat();
    assert_eq!(0, stat.delcount);
    assert_eq!(fdnext_before, stat.fdnextpage);
    fs.verify();
    drop(fs);
    assert!(Unfs::check(&disk.device()).is_ok());
}

/// 文件项区按 FILE_PC 步长生长
#[test]
fn entry_region_layout() {
    let disk = TestDisk::new("region", 16 << 20);
    Unfs::format(&disk.device(), "region").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();

    let s0 = fs.stat();
    fs.create("/one", false, false).unwrap();
    let s1 = fs.stat();
    assert_eq!(s0.fdnextpage - FILE_PC, s1.fdnextpage);
    assert_eq!(s0.pagefree - FILE_PC, s1.pagefree);
    fs.verify();
}
