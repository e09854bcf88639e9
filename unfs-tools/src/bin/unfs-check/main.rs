use std::process::exit;

use clap::Parser;

/// 只读校验设备上的 UNFS 文件系统：打印头部并报告首个不一致
#[derive(Parser)]
struct Cli {
    /// 设备名，缺省取环境变量 UNFS_DEVICE
    device: Option<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let Some(device) = cli.device.or_else(|| std::env::var("UNFS_DEVICE").ok()) else {
        eprintln!("no device given and UNFS_DEVICE not set");
        exit(1);
    };

    // 头部读不出来也继续，让校验去报告问题所在
    match unfs::Unfs::open(&device) {
        Ok(fs) => print!("{}", fs.stat()),
        Err(e) => eprintln!("{device}: cannot read header ({e})"),
    }

    match unfs::Unfs::check(&device) {
        Ok(()) => println!("{device}: ok"),
        Err(e) => {
            eprintln!("{device}: inconsistent ({e})");
            exit(1);
        }
    }
}
