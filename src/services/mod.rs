// 服务模块

pub mod sftp;
pub mod storage;
