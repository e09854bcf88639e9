use clap::Parser;
use typed_bytesize::ByteSizeIec;

/// 在设备或镜像文件上创建空的 UNFS 文件系统
#[derive(Parser)]
pub struct Cli {
    /// 盘标签
    #[arg(long, short, default_value = "User Space Nameless Filesystem")]
    pub label: String,

    /// 不打印头部信息
    #[arg(long, short)]
    pub quiet: bool,

    /// 先把设备按镜像文件创建并设成该大小（如 1GiB）
    #[arg(long)]
    pub size: Option<ByteSizeIec>,

    /// 设备名，缺省取环境变量 UNFS_DEVICE
    pub device: Option<String>,
}
