//! 测试偏好模式 (Test Prefer Modes)
//!
//! 自动测试的阈值、阶段开关与最优节点策略的具名预设。
//! 内置模式始终存在且不可删除；用户模式持久化在 `prefer_modes.json`。

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, warn};

use crate::core::error::{PilotError, Result};
use crate::utils::save_file;

pub const BUILTIN_CHAT_ID: &str = "builtin_chat";
pub const BUILTIN_DOWNLOAD_ID: &str = "builtin_download";

/// 允许的测速负载大小 (MB)
pub const PAYLOAD_SIZES_MB: [u32; 4] = [1, 10, 25, 50];
const DEFAULT_PAYLOAD_MB: u32 = 10;
const MIN_LATENCY_THRESHOLD_MS: u32 = 50;
const MIN_BANDWIDTH_THRESHOLD_MBPS: f64 = 1.0;
const MAX_NODE_LIMIT: usize = 200;

/// 延迟测试方式
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum LatencyMode {
    #[default]
    UrlTest,
    Tcping,
}

/// 最优节点的排序依据
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum BestNodePriority {
    #[default]
    Latency,
    Upload,
    Download,
    UnlockCount,
}

/// 解锁排序的子模式
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum UnlockPriorityMode {
    #[default]
    Count,
    TargetSites,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestPreferMode {
    pub id: String,
    pub name: String,
    pub built_in: bool,
    /// 关闭时过滤阶段只标注状态，不移除节点
    pub filter_unavailable: bool,
    pub latency_enabled: bool,
    pub latency_mode: LatencyMode,
    pub latency_threshold_ms: u32,
    pub bandwidth_enabled: bool,
    pub bandwidth_download_enabled: bool,
    pub bandwidth_upload_enabled: bool,
    pub bandwidth_download_threshold_mbps: f64,
    pub bandwidth_upload_threshold_mbps: f64,
    pub bandwidth_download_size_mb: u32,
    pub bandwidth_upload_size_mb: u32,
    pub unlock_enabled: bool,
    /// 按地区分桶采样，否则整体截取前 `node_limit` 个
    pub by_region: bool,
    pub node_limit: usize,
    pub default_priority: BestNodePriority,
    pub unlock_priority_mode: UnlockPriorityMode,
    pub unlock_priority_target_site_ids: Vec<String>,
}

impl Default for TestPreferMode {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            built_in: false,
            filter_unavailable: true,
            latency_enabled: true,
            latency_mode: LatencyMode::UrlTest,
            latency_threshold_ms: 600,
            bandwidth_enabled: false,
            bandwidth_download_enabled: true,
            bandwidth_upload_enabled: false,
            bandwidth_download_threshold_mbps: 10.0,
            bandwidth_upload_threshold_mbps: 5.0,
            bandwidth_download_size_mb: DEFAULT_PAYLOAD_MB,
            bandwidth_upload_size_mb: DEFAULT_PAYLOAD_MB,
            unlock_enabled: false,
            by_region: false,
            node_limit: 20,
            default_priority: BestNodePriority::Latency,
            unlock_priority_mode: UnlockPriorityMode::Count,
            unlock_priority_target_site_ids: Vec::new(),
        }
    }
}

fn normalize_size(mb: u32) -> u32 {
    if PAYLOAD_SIZES_MB.contains(&mb) {
        mb
    } else {
        DEFAULT_PAYLOAD_MB
    }
}

impl TestPreferMode {
    /// 修正越界取值
    pub fn normalized(mut self) -> Self {
        self.latency_threshold_ms = self.latency_threshold_ms.max(MIN_LATENCY_THRESHOLD_MS);
        if !self.bandwidth_download_threshold_mbps.is_finite() {
            self.bandwidth_download_threshold_mbps = MIN_BANDWIDTH_THRESHOLD_MBPS;
        }
        if !self.bandwidth_upload_threshold_mbps.is_finite() {
            self.bandwidth_upload_threshold_mbps = MIN_BANDWIDTH_THRESHOLD_MBPS;
        }
        self.bandwidth_download_threshold_mbps = self
            .bandwidth_download_threshold_mbps
            .max(MIN_BANDWIDTH_THRESHOLD_MBPS);
        self.bandwidth_upload_threshold_mbps = self
            .bandwidth_upload_threshold_mbps
            .max(MIN_BANDWIDTH_THRESHOLD_MBPS);
        self.bandwidth_download_size_mb = normalize_size(self.bandwidth_download_size_mb);
        self.bandwidth_upload_size_mb = normalize_size(self.bandwidth_upload_size_mb);
        self.node_limit = self.node_limit.clamp(1, MAX_NODE_LIMIT);
        self.unlock_priority_target_site_ids
            .retain(|s| !s.trim().is_empty());
        self
    }

    /// 以新 id 与名称复制为用户模式
    pub fn save_as(&self, name: impl Into<String>) -> Self {
        let suffix: u32 = rand::rng().random();
        Self {
            id: format!("user_{:08x}", suffix),
            name: name.into(),
            built_in: false,
            ..self.clone()
        }
        .normalized()
    }

    /// 带宽阶段在两个方向都关闭时视为未启用
    pub fn bandwidth_active(&self) -> bool {
        self.bandwidth_enabled
            && (self.bandwidth_download_enabled || self.bandwidth_upload_enabled)
    }
}

/// 内置模式
pub fn builtin_modes() -> Vec<TestPreferMode> {
    vec![
        TestPreferMode {
            id: BUILTIN_CHAT_ID.to_string(),
            name: "低延迟 (聊天)".to_string(),
            built_in: true,
            latency_threshold_ms: 300,
            ..Default::default()
        },
        TestPreferMode {
            id: BUILTIN_DOWNLOAD_ID.to_string(),
            name: "大流量 (下载)".to_string(),
            built_in: true,
            bandwidth_enabled: true,
            bandwidth_download_threshold_mbps: 20.0,
            bandwidth_download_size_mb: 25,
            node_limit: 10,
            default_priority: BestNodePriority::Download,
            ..Default::default()
        },
    ]
}

/// 偏好模式的 JSON 持久化
pub struct PreferStore {
    path: PathBuf,
}

impl PreferStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join("prefer_modes.json"),
        }
    }

    /// 内置模式在前，随后为归一化后的用户模式；损坏的文件按空处理
    pub async fn load(&self) -> Vec<TestPreferMode> {
        let mut modes = builtin_modes();
        let user: Vec<TestPreferMode> = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("偏好模式文件损坏，已忽略: {}", e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        debug!("加载 {} 个用户偏好模式", user.len());

        modes.extend(
            user.into_iter()
                .filter(|m| !m.built_in && !m.id.is_empty())
                .filter(|m| m.id != BUILTIN_CHAT_ID && m.id != BUILTIN_DOWNLOAD_ID)
                .map(TestPreferMode::normalized),
        );
        modes
    }

    pub async fn find(&self, id: &str) -> Option<TestPreferMode> {
        self.load().await.into_iter().find(|m| m.id == id)
    }

    /// 找不到时回退到第一个内置模式
    pub async fn find_or_default(&self, id: &str) -> TestPreferMode {
        let modes = self.load().await;
        modes
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .unwrap_or_else(|| {
                warn!("未找到偏好模式 {}，使用默认模式", id);
                modes[0].clone()
            })
    }

    async fn save_user(&self, modes: &[TestPreferMode]) -> Result<()> {
        let user: Vec<&TestPreferMode> = modes.iter().filter(|m| !m.built_in).collect();
        let json = serde_json::to_vec_pretty(&user)?;
        save_file(&self.path, &json).await?;
        Ok(())
    }

    /// 新增或覆盖一个用户模式
    pub async fn upsert(&self, mode: TestPreferMode) -> Result<TestPreferMode> {
        if mode.built_in || mode.id == BUILTIN_CHAT_ID || mode.id == BUILTIN_DOWNLOAD_ID {
            return Err(PilotError::Custom(format!("内置模式不可修改: {}", mode.id)));
        }
        let mode = mode.normalized();
        let mut modes = self.load().await;
        match modes.iter_mut().find(|m| m.id == mode.id) {
            Some(existing) => *existing = mode.clone(),
            None => modes.push(mode.clone()),
        }
        self.save_user(&modes).await?;
        Ok(mode)
    }

    pub async fn save_as(&self, base_id: &str, name: &str) -> Result<TestPreferMode> {
        let base = self
            .find(base_id)
            .await
            .ok_or_else(|| PilotError::Custom(format!("未找到偏好模式: {}", base_id)))?;
        self.upsert(base.save_as(name)).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut modes = self.load().await;
        let before = modes.len();
        modes.retain(|m| m.built_in || m.id != id);
        if modes.len() == before {
            return Ok(false);
        }
        self.save_user(&modes).await?;
        Ok(true)
    }
}
