//! Truvis 工具集
//!
//! 提供日志初始化、资源路径管理等在各个 crate 之间共享的工具。
//!
//! # TruvisPath
//! 基于工作区根目录的统一路径管理，避免硬编码相对路径。

pub mod init_log;
pub mod resource;
