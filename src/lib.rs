//! nodepilot
//!
//! sing-box 前端：订阅解析、配置生成、节点测量与自动化择优。

pub mod actors;
pub mod core;
pub mod engine;
pub mod generator;
pub mod probe;
pub mod ui;
pub mod utils;
