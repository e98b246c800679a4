// Ocultum - SSH 密钥部署与远程命令执行
//
// 模块结构:
// - ssh: SSH 传输（连接、主机信任、文件读写、命令执行）
// - vault: 凭据加解密
// - models: 主机、任务与设置数据结构
// - store: SQLite 持久化（主机、公钥、任务与输出）
// - services: 配置文件与 SFTP 封装
// - ops: 远程操作（部署公钥、执行命令）
// - runner: 任务执行器与工作池
// - live: 实时输出通道
// - tasks: 入队、查询与订阅入口

pub mod live;
pub mod models;
pub mod ops;
pub mod runner;
pub mod services;
pub mod ssh;
pub mod store;
pub mod tasks;
pub mod vault;

#[cfg(test)]
mod test_utils;
