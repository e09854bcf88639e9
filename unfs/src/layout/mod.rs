//! 磁盘数据结构层
//!
//! 页 0-1 是头部（删除栈占满两页的剩余空间），页 2 起是空闲页位图，
//! 数据区从 `datapage` 向上生长，文件项区从盘尾向下生长。
//! 每个文件项两页：记录页加规范名页，盘尾最后一项固定是根目录。

mod header;
mod node;

pub use self::header::{Header, HeaderBuf, DELSTACK_MAX};
pub use self::node::{entry_name, DiskNode, Segment, MAX_DS};
