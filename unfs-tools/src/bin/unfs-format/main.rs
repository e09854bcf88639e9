mod cli;

use std::fs::OpenOptions;
use std::process::exit;

use clap::Parser;

use self::cli::Cli;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let Some(device) = cli.device.or_else(|| std::env::var("UNFS_DEVICE").ok()) else {
        eprintln!("no device given and UNFS_DEVICE not set");
        exit(1);
    };

    if let Some(size) = cli.size {
        // 镜像文件先建好再定长
        let fd = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&device)
        {
            Ok(fd) => fd,
            Err(e) => {
                eprintln!("create {device}: {e}");
                exit(1);
            }
        };
        if let Err(e) = fd.set_len(size.0) {
            eprintln!("resize {device}: {e}");
            exit(1);
        }
    }

    if !cli.quiet {
        println!("UNFS format device {device} label {:?}", cli.label);
    }
    match unfs::Unfs::format(&device, &cli.label) {
        Ok(header) => {
            if !cli.quiet {
                print!("{header}");
            }
        }
        Err(e) => {
            eprintln!("format {device}: {e}");
            exit(1);
        }
    }
}
