//! 订阅管理工具 (Subscription Management)
//!
//! 分层解码订阅负载 (解密 → 嵌套 Base64 → 传统 Base64 → 明文)，逐行解析节点，
//! 并提供带磁盘回退缓存的 HTTP 拉取。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::error::{PilotError, Result};
use crate::core::model::NodeRecord;
use crate::utils::crypto::{KeySource, decrypt_payload};
use crate::utils::link::parse_link;
use crate::utils::{decode_base64_text, save_file};

/// 解码结果是否像一份节点列表
fn is_plausible(text: &str) -> bool {
    text.contains("://")
}

/// 第一层：对称解密，必要时再做一次 Base64
fn try_decrypt(body: &str, key_source: Option<&dyn KeySource>) -> Option<String> {
    let key = key_source?.key()?;
    let decrypted = match decrypt_payload(body, &key) {
        Ok(text) => text,
        Err(e) => {
            debug!("订阅解密跳过: {}", e);
            return None;
        }
    };

    if is_plausible(&decrypted) {
        return Some(decrypted);
    }
    decode_base64_text(decrypted.trim()).filter(|t| is_plausible(t))
}

/// 将原始负载解码为文本
pub fn decode_text(body: &str, key_source: Option<&dyn KeySource>) -> String {
    let body = body.trim();

    if let Some(text) = try_decrypt(body, key_source) {
        debug!("订阅负载解密成功");
        return text;
    }

    match decode_base64_text(body) {
        Some(text) => text,
        None => {
            debug!("Base64 解码失败，按明文处理");
            body.to_string()
        }
    }
}

/// 解码订阅负载并逐行解析节点
///
/// 单行失败只会被记录并跳过。
pub fn decode_subscription(body: &str, key_source: Option<&dyn KeySource>) -> Vec<NodeRecord> {
    let text = decode_text(body, key_source);
    if !is_plausible(&text) {
        warn!("订阅内容中未发现任何节点链接");
        return Vec::new();
    }

    let mut dropped = 0usize;
    let nodes: Vec<NodeRecord> = text
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match parse_link(line) {
            Ok(node) => Some(node),
            Err(e) => {
                dropped += 1;
                warn!("丢弃无法解析的链接 ({}): {}", e, truncate(line, 48));
                None
            }
        })
        .collect();

    debug!("解析得到 {} 个节点，丢弃 {} 行", nodes.len(), dropped);
    nodes
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

/// 节点来源
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>>;
}

/// 订阅拉取客户端
pub struct SubscriptionClient {
    client: Client,
    url: String,
    cache_dir: PathBuf,
    key_source: Option<Box<dyn KeySource>>,
}

#[derive(Serialize, Deserialize)]
struct BodyCache {
    hash: String,
    body: String,
}

impl SubscriptionClient {
    pub fn new(
        url: impl Into<String>,
        timeout_secs: u64,
        cache_dir: &Path,
        key_source: Option<Box<dyn KeySource>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            cache_dir: cache_dir.to_path_buf(),
            key_source,
        })
    }

    fn cache_file(&self) -> PathBuf {
        self.cache_dir.join("subscription_cache.json")
    }

    fn url_hash(&self) -> String {
        blake3::hash(self.url.as_bytes()).to_hex().to_string()
    }

    /// 拉取原始负载，失败时回退到上次成功的缓存
    pub async fn fetch_body(&self) -> Result<String> {
        debug!("Fetching subscription: {}", self.url);
        let fetched = async {
            let resp = self.client.get(&self.url).send().await?;
            let resp = resp.error_for_status()?;
            resp.text().await
        }
        .await;

        match fetched {
            Ok(body) => {
                let cache = BodyCache {
                    hash: self.url_hash(),
                    body: body.clone(),
                };
                if let Ok(json) = serde_json::to_vec(&cache)
                    && let Err(e) = save_file(self.cache_file(), &json).await
                {
                    warn!("写入订阅缓存失败: {}", e);
                }
                Ok(body)
            }
            Err(e) => {
                warn!("订阅请求失败: {}", e);
                if let Ok(data) = tokio::fs::read_to_string(self.cache_file()).await
                    && let Ok(cache) = serde_json::from_str::<BodyCache>(&data)
                    && cache.hash == self.url_hash()
                {
                    info!("使用缓存的订阅内容");
                    return Ok(cache.body);
                }
                Err(PilotError::Network(e))
            }
        }
    }
}

#[async_trait]
impl NodeSource for SubscriptionClient {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>> {
        let body = self.fetch_body().await?;
        Ok(decode_subscription(&body, self.key_source.as_deref()))
    }
}

/// 固定的节点列表，用于本地导入
pub struct StaticSource(pub Vec<NodeRecord>);

#[async_trait]
impl NodeSource for StaticSource {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::NodeType;
    use crate::utils::crypto::{StaticKey, encrypt_payload};
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    const LINES: &str = "trojan://pw@a.example.com:443#A\r\nvless://uuid@b.example.com:8443#B\n";

    #[test]
    fn plaintext_and_base64_agree() {
        let plain = decode_subscription(LINES, None);
        let wrapped = decode_subscription(&STANDARD.encode(LINES), None);
        assert_eq!(plain.len(), 2);
        assert_eq!(plain, wrapped);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let body = "trojan://pw@a.example.com:443#A\nnot a link\ntuic://x@h:1\n\n  ss://%%%  \nvless://u@b.example.com#B";
        let nodes = decode_subscription(body, None);
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn encrypted_payload() {
        let body = encrypt_payload(LINES, "k3y", [9u8; 12]).unwrap();
        let key = StaticKey(Some("k3y".into()));
        let nodes = decode_subscription(&body, Some(&key));
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_type, NodeType::Trojan);
    }

    #[test]
    fn encrypted_base64_payload() {
        let inner = STANDARD.encode(LINES);
        let body = encrypt_payload(&inner, "k3y", [3u8; 12]).unwrap();
        let key = StaticKey(Some("k3y".into()));
        assert_eq!(decode_subscription(&body, Some(&key)).len(), 2);
    }

    #[test]
    fn wrong_key_falls_back_to_legacy_base64() {
        let body = STANDARD.encode(LINES);
        let key = StaticKey(Some("unrelated".into()));
        assert_eq!(decode_subscription(&body, Some(&key)).len(), 2);
    }

    #[test]
    fn garbage_yields_no_nodes() {
        assert!(decode_subscription("hello world", None).is_empty());
        assert!(decode_subscription("", None).is_empty());
    }
}
