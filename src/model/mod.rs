//! 配置与数据模型

pub mod config;
pub mod registry;
pub mod sample;
