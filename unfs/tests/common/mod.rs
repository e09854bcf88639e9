//! 测试公用：临时镜像文件当设备

use std::fs::OpenOptions;
use std::path::PathBuf;

pub struct TestDisk {
    path: PathBuf,
}

impl TestDisk {
    /// 在临时目录建一块定长镜像
    pub fn new(name: &str, bytes: u64) -> Self {
        let path = std::env::temp_dir().join(format!(
            "unfs-{name}-{}.img",
            std::process::id()
        ));
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        fd.set_len(bytes).unwrap();
        Self { path }
    }

    pub fn device(&self) -> String {
        self.path.to_str().unwrap().to_string()
    }
}

impl Drop for TestDisk {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
