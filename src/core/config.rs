//! 配置管理系统 (Configuration Management)
//!
//! 负责 `config.toml` 的反序列化及其层级结构映射，支持环境变量与默认值回退机制。
//! 环境变量前缀为 `NODEPILOT`，层级分隔符为 `__`，例如 `NODEPILOT__PROBE__TCP_CONCURRENCY=32`。

use std::path::Path;

use bon::Builder;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::core::error::{PilotError, Result};
use crate::core::model::{Ipv6Mode, PerAppMode, ProxyMode, RoutingOptions};

/// 全局应用配置
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct AppConfig {
    /// 缓存与持久化目录基准路径
    #[serde(default = "default_cache_path")]
    #[builder(default = default_cache_path())]
    pub cache_path: String,

    /// 订阅源
    #[serde(default)]
    #[builder(default)]
    pub subscription: SubscriptionConfig,

    /// 路由生成选项
    #[serde(default)]
    #[builder(default)]
    pub routing: RoutingConfig,

    /// 外部核心 (sing-box) 相关配置
    #[serde(default)]
    #[builder(default)]
    pub singbox: SingboxConfig,

    /// 探测参数
    #[serde(default)]
    #[builder(default)]
    pub probe: ProbeConfig,

    /// 自动化测试
    #[serde(default)]
    #[builder(default)]
    pub autotest: AutoTestSection,
}

/// 订阅配置
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct SubscriptionConfig {
    pub url: Option<String>,
    /// 请求超时 (秒)
    #[serde(default = "default_fetch_timeout")]
    #[builder(default = default_fetch_timeout())]
    pub timeout_secs: u64,
    /// 订阅负载的对称解密密钥，缺省则跳过解密层
    pub decrypt_key: Option<String>,
}

/// 路由选项，对应生成器的 [`RoutingOptions`]
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct RoutingConfig {
    #[serde(default)]
    #[builder(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub bypass_lan: bool,
    #[serde(default)]
    #[builder(default)]
    pub ipv6_mode: Ipv6Mode,
    pub selected_node_id: Option<String>,
    /// 分应用代理模式
    #[serde(default)]
    #[builder(default)]
    pub per_app_mode: PerAppMode,
    /// 分应用代理包名列表
    #[serde(default)]
    #[builder(default)]
    pub per_app_packages: Vec<String>,
}

/// 外部核心配置
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct SingboxConfig {
    /// 二进制执行文件搜索路径
    #[serde(default = "default_bin_path")]
    #[builder(default = default_bin_path())]
    pub bin_path: String,
    /// 主实例 clash API 端口
    #[serde(default = "default_api_port")]
    #[builder(default = default_api_port())]
    pub api_port: u16,
    /// 无 TUN 测速实例的 clash API 端口
    #[serde(default = "default_headless_api_port")]
    #[builder(default = default_headless_api_port())]
    pub headless_api_port: u16,
    /// 网卡绑定 (测速实例使用)
    pub bind_interface: Option<String>,
}

/// 探测参数
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_tcp_concurrency")]
    #[builder(default = default_tcp_concurrency())]
    pub tcp_concurrency: usize,
    #[serde(default = "default_tcp_timeout")]
    #[builder(default = default_tcp_timeout())]
    pub tcp_timeout_ms: u64,
    #[serde(default = "default_url_concurrency")]
    #[builder(default = default_url_concurrency())]
    pub url_concurrency: usize,
    #[serde(default = "default_url_timeout")]
    #[builder(default = default_url_timeout())]
    pub url_timeout_ms: u64,
    #[serde(default = "default_test_url")]
    #[builder(default = default_test_url())]
    pub test_url: String,
    #[serde(default = "default_download_url")]
    #[builder(default = default_download_url())]
    pub download_url: String,
    #[serde(default = "default_upload_url")]
    #[builder(default = default_upload_url())]
    pub upload_url: String,
    /// 流媒体解锁检测程序路径
    #[serde(default = "default_unlock_bin")]
    #[builder(default = default_unlock_bin())]
    pub unlock_bin: String,
    #[serde(default = "default_unlock_concurrency")]
    #[builder(default = default_unlock_concurrency())]
    pub unlock_concurrency: usize,
    #[serde(default = "default_unlock_timeout")]
    #[builder(default = default_unlock_timeout())]
    pub unlock_timeout_secs: u64,
}

/// 自动化测试设置
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct AutoTestSection {
    /// 当前选用的偏好模式 id
    #[serde(default = "default_prefer_mode")]
    #[builder(default = default_prefer_mode())]
    pub prefer_mode: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_fetch_timeout(),
            decrypt_key: None,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            proxy_mode: ProxyMode::default(),
            bypass_lan: true,
            ipv6_mode: Ipv6Mode::default(),
            selected_node_id: None,
            per_app_mode: PerAppMode::default(),
            per_app_packages: Vec::new(),
        }
    }
}

impl Default for SingboxConfig {
    fn default() -> Self {
        Self {
            bin_path: default_bin_path(),
            api_port: default_api_port(),
            headless_api_port: default_headless_api_port(),
            bind_interface: None,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tcp_concurrency: default_tcp_concurrency(),
            tcp_timeout_ms: default_tcp_timeout(),
            url_concurrency: default_url_concurrency(),
            url_timeout_ms: default_url_timeout(),
            test_url: default_test_url(),
            download_url: default_download_url(),
            upload_url: default_upload_url(),
            unlock_bin: default_unlock_bin(),
            unlock_concurrency: default_unlock_concurrency(),
            unlock_timeout_secs: default_unlock_timeout(),
        }
    }
}

impl Default for AutoTestSection {
    fn default() -> Self {
        Self {
            prefer_mode: default_prefer_mode(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_cache_path() -> String {
    "cache".to_string()
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_bin_path() -> String {
    "bin".to_string()
}
fn default_api_port() -> u16 {
    9090
}
fn default_headless_api_port() -> u16 {
    19090
}
fn default_tcp_concurrency() -> usize {
    16
}
fn default_tcp_timeout() -> u64 {
    3000
}
fn default_url_concurrency() -> usize {
    10
}
fn default_url_timeout() -> u64 {
    5000
}
fn default_test_url() -> String {
    "https://www.google.com/generate_204".to_string()
}
fn default_download_url() -> String {
    "https://speed.cloudflare.com/__down".to_string()
}
fn default_upload_url() -> String {
    "https://speed.cloudflare.com/__up".to_string()
}
fn default_unlock_bin() -> String {
    "unlock-test".to_string()
}
fn default_unlock_concurrency() -> usize {
    2
}
fn default_unlock_timeout() -> u64 {
    120
}
fn default_prefer_mode() -> String {
    crate::core::prefer::BUILTIN_CHAT_ID.to_string()
}

impl AppConfig {
    /// 从文件系统中加载并解析配置
    ///
    /// `path` 缺省时读取工作目录下的 `config.toml` (不存在则全部取默认值)。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.unwrap_or_else(|| Path::new("config.toml"));
        let builder = Config::builder();

        let builder = if config_path.exists() {
            builder.add_source(File::from(config_path))
        } else {
            builder
        };

        let settings = builder
            .add_source(
                Environment::with_prefix("NODEPILOT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(PilotError::Config)?;
        settings.try_deserialize().map_err(PilotError::Config)
    }

    /// 组装生成器所需的路由选项
    pub fn routing_options(&self) -> RoutingOptions {
        RoutingOptions {
            selected_node_id: self.routing.selected_node_id.clone(),
            proxy_mode: self.routing.proxy_mode,
            bypass_lan: self.routing.bypass_lan,
            ipv6_mode: self.routing.ipv6_mode,
            per_app_mode: self.routing.per_app_mode,
            per_app_packages: self.routing.per_app_packages.clone(),
        }
    }
}
