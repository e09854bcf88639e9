//! 多线程下的锁序与位图完好性

mod common;

use std::sync::Barrier;

use common::TestDisk;
use enumflags2::BitFlags;
use unfs::{FsError, OpenMode, Unfs};

/// （文件大小，偏移，长度）
const RMW_TABLE: &[(u64, u64, u64)] = &[
    (1, 0, 1),
    (4000, 0, 4000),
    (4000, 0, 3999),
    (4000, 2001, 1999),
    (4000, 3000, 900),
    (8000, 0, 8000),
    (8000, 7999, 1),
    (8000, 2, 4094),
    (8000, 4096, 1),
    (8000, 4097, 3003),
    (12000, 0, 7000),
    (12000, 2, 4094),
    (12000, 1, 1),
    (12000, 4096, 1),
    (12000, 6000, 6000),
    (12000, 0, 12000),
    (16000, 0, 7000),
    (16000, 15999, 1),
    (16000, 1, 1),
    (16000, 8192, 7000),
    (16000, 8000, 8000),
    (16000, 0, 12000),
    (32768, 0, 32768),
    (32768, 16382, 16384),
    (32768, 512, 16381),
    (32768, 0, 12),
    (65501, 0, 65501),
    (65501, 0, 60000),
    (65501, 123, 65378),
    (65501, 1, 23456),
    (65501, 65000, 500),
    (65501, 5001, 40001),
    (262000, 0, 262000),
    (262000, 0, 261001),
    (262000, 2000, 260000),
    (262000, 1111, 1111),
    (262000, 22222, 222222),
    (262000, 233333, 1),
    (262000, 260000, 1000),
];

/// 一行读改写：整文件铺 0xFF，区间写花样，逐字节核对
fn run_rmw(f: &unfs::File, filesize: u64, offset: u64, len: u64, pat: u8) {
    f.resize(filesize, None).unwrap();

    let base = vec![0xFFu8; filesize as usize];
    f.write(&base, 0).unwrap();

    let mut expect = base;
    expect[offset as usize..(offset + len) as usize].fill(pat);
    f.write(&expect[offset as usize..(offset + len) as usize], offset)
        .unwrap();

    let mut got = vec![0u8; filesize as usize];
    f.read(&mut got, 0).unwrap();
    assert_eq!(expect, got, "off={offset} len={len} size={filesize}");
}

/// 64 线程各写各的文件过整张读改写表，不死锁、不搅坏位图；
/// 收尾核对头部账目并整盘校验
#[test]
fn parallel_writers() {
    let disk = TestDisk::new("parallel", 256 << 20);
    Unfs::format(&disk.device(), "parallel").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();

    const THREADS: usize = 64;
    let barrier = Barrier::new(THREADS);
    std::thread::scope(|s| {
        for tid in 1..=THREADS {
            let fs = &fs;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let name = format!("/rmw{tid}");
                let mut pat = tid as u8;

                // 正着过一遍表
                let f = fs.file_open(&name, OpenMode::Create.into()).unwrap();
                for &(filesize, offset, len) in RMW_TABLE {
                    pat = pat.wrapping_add(1);
                    run_rmw(&f, filesize, offset, len, pat);
                }
                f.close();

                // 重开再倒着来一遍，覆盖收缩后再增长的路径
                let f = fs.file_open(&name, BitFlags::empty()).unwrap();
                for &(filesize, offset, len) in RMW_TABLE.iter().rev() {
                    pat = pat.wrapping_add(1);
                    run_rmw(&f, filesize, offset, len, pat);
                }
                f.resize(tid as u64, None).unwrap();
                f.close();
            });
        }
    });

    fs.verify();
    for tid in 1..=THREADS {
        assert_eq!(
            Some((false, tid as u64)),
            fs.exist(&format!("/rmw{tid}"))
        );
    }
    drop(fs);

    let fs = Unfs::open(&disk.device()).unwrap();
    for tid in 1..=THREADS {
        assert_eq!(
            Some((false, tid as u64)),
            fs.exist(&format!("/rmw{tid}"))
        );
    }
    // 收尾账目：每个文件缩到一页，没有删除过任何项
    let stat = fs.stat();
    assert_eq!(THREADS as u64 + 1, stat.fdcount);
    assert_eq!(1, stat.dircount);
    assert_eq!(0, stat.delcount);
    assert_eq!(
        stat.pagecount - (stat.fdcount + 1) * unfs::FILE_PC,
        stat.fdnextpage
    );
    assert_eq!(
        stat.pagecount - stat.datapage - stat.fdcount * unfs::FILE_PC - THREADS as u64,
        stat.pagefree
    );
    fs.verify();
    drop(fs);
    assert!(Unfs::check(&disk.device()).is_ok());
}

/// 同一文件并发追加与读取不死锁
#[test]
fn shared_file_extension() {
    let disk = TestDisk::new("shared", 64 << 20);
    Unfs::format(&disk.device(), "shared").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();
    fs.create("/shared", false, false).unwrap();

    const THREADS: usize = 8;
    let barrier = Barrier::new(THREADS);
    std::thread::scope(|s| {
        for tid in 0..THREADS {
            let fs = &fs;
            let barrier = &barrier;
            s.spawn(move || {
                let f = fs.file_open("/shared", BitFlags::empty()).unwrap();
                barrier.wait();
                for round in 0..16u64 {
                    // 各线程写自己的固定区间，越界写触发并发扩容
                    let off = (tid as u64 * 16 + round) * 4096;
                    f.write(&[tid as u8 + 1; 4096], off).unwrap();
                    let mut back = [0u8; 4096];
                    f.read(&mut back, off).unwrap();
                    assert_eq!([tid as u8 + 1; 4096], back);
                }
                f.close();
            });
        }
    });

    let f = fs.file_open("/shared", BitFlags::empty()).unwrap();
    assert_eq!(THREADS as u64 * 16 * 4096, f.stat().size);
    f.close();
    fs.verify();
    drop(fs);
    assert!(Unfs::check(&disk.device()).is_ok());
}

/// 并发去创建同一个缺失目录下的文件：
/// 不带 parents 的那些要么撞上 not-found，要么看见别人补好的目录
#[test]
fn create_under_missing_parent() {
    let disk = TestDisk::new("race", 64 << 20);
    Unfs::format(&disk.device(), "race").unwrap();
    let fs = Unfs::open(&disk.device()).unwrap();

    const THREADS: usize = 8;
    let barrier = Barrier::new(THREADS);
    std::thread::scope(|s| {
        for tid in 0..THREADS {
            let fs = &fs;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let name = format!("/race/f{tid}");
                if tid % 2 == 0 {
                    fs.create(&name, false, true).unwrap();
                } else {
                    match fs.create(&name, false, false) {
                        Ok(()) => assert_eq!(Some((true, 0)), fs.exist("/race").map(|(d, _)| (d, 0))),
                        Err(e) => assert_eq!(FsError::NotFound, e),
                    }
                }
            });
        }
    });

    // 目录只会创建一份，子计数与实际一致
    let (isdir, size) = fs.exist("/race").unwrap();
    assert!(isdir);
    assert_eq!(size as usize, fs.dir_list("/race").unwrap().len());
    fs.verify();

    // 独占打开在并发下恰好一个赢家
    fs.create("/excl", false, false).unwrap();
    let start = Barrier::new(THREADS);
    let tried = Barrier::new(THREADS);
    let wins = std::sync::atomic::AtomicU32::new(0);
    std::thread::scope(|s| {
        for _ in 0..THREADS {
            let fs = &fs;
            let (start, tried) = (&start, &tried);
            let wins = &wins;
            s.spawn(move || {
                start.wait();
                let won = fs.file_open("/excl", OpenMode::Exclusive.into());
                if won.is_ok() {
                    wins.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                // 赢家握着句柄直到所有线程都试过
                tried.wait();
                drop(won);
            });
        }
    });
    assert_eq!(1, wins.load(std::sync::atomic::Ordering::Relaxed));
    fs.verify();
}
