//! 目录型数据源与产品存储
//!
//! - `DirectorySource`: 把挂载目录（如 NFS 导出的数据源）当作产品源
//! - `DirectoryProductStore`: 本地产品目录，同时实现按文件时间淘汰的触发器

mod source;
mod store;

pub use source::DirectorySource;
pub use store::DirectoryProductStore;
