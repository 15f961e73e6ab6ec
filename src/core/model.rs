//! 领域模型 (Domain Model)
//!
//! 节点记录、协议类型、延迟状态以及生成器的路由选项。

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// 节点协议类型
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum NodeType {
    Vless,
    Vmess,
    Trojan,
    Hysteria2,
    Shadowsocks,
    Socks,
    Http,
    #[default]
    Unknown,
}

impl NodeType {
    /// 按链接前缀识别协议 (不区分大小写)
    pub fn from_link(link: &str) -> Self {
        let lower = link.trim_start().to_ascii_lowercase();
        const PREFIXES: &[(&str, NodeType)] = &[
            ("vless://", NodeType::Vless),
            ("vmess://", NodeType::Vmess),
            ("trojan://", NodeType::Trojan),
            ("hysteria2://", NodeType::Hysteria2),
            ("hy2://", NodeType::Hysteria2),
            ("ss://", NodeType::Shadowsocks),
            ("socks://", NodeType::Socks),
            ("socks5://", NodeType::Socks),
            ("socks4://", NodeType::Socks),
            ("http://", NodeType::Http),
            ("https://", NodeType::Http),
        ];
        PREFIXES
            .iter()
            .find(|(prefix, _)| lower.starts_with(prefix))
            .map(|(_, t)| *t)
            .unwrap_or(Self::Unknown)
    }

    /// 无名称时使用的占位名
    pub fn placeholder_name(&self) -> &'static str {
        match self {
            Self::Vless => "VLESS Node",
            Self::Vmess => "VMess Node",
            Self::Trojan => "Trojan Node",
            Self::Hysteria2 => "Hysteria2 Node",
            Self::Shadowsocks => "Shadowsocks Node",
            Self::Socks => "Socks Node",
            Self::Http => "HTTP Node",
            Self::Unknown => "Unknown Node",
        }
    }
}

/// 延迟测量状态
///
/// 持久化时沿用整数编码：`-1` 未测试，`-2` 超时/不可达，非负为毫秒。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Latency {
    #[default]
    Untested,
    Unreachable,
    Measured(u32),
}

impl Latency {
    /// 成功测量的毫秒数
    pub fn millis(&self) -> Option<u32> {
        match self {
            Latency::Measured(ms) => Some(*ms),
            _ => None,
        }
    }

    /// 是否为一次成功的探测
    pub fn is_measured(&self) -> bool {
        matches!(self, Latency::Measured(_))
    }
}

impl From<i64> for Latency {
    fn from(raw: i64) -> Self {
        match raw {
            -1 => Latency::Untested,
            r if r < 0 => Latency::Unreachable,
            r => Latency::Measured(u32::try_from(r).unwrap_or(u32::MAX)),
        }
    }
}

impl From<Latency> for i64 {
    fn from(l: Latency) -> Self {
        match l {
            Latency::Untested => -1,
            Latency::Unreachable => -2,
            Latency::Measured(ms) => i64::from(ms),
        }
    }
}

/// 延迟等级 (用于着色)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyLevel {
    Good,
    Medium,
    Bad,
}

/// 自动化测试中节点所处的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoTestStatus {
    LatencyPassed,
    LatencyFiltered,
    BandwidthPassed,
    BandwidthFiltered,
    UnlockPassed,
    UnlockFailed,
}

/// 一个代理节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// rawLink 的 MD5 (小写十六进制)
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub server: String,
    pub port: u16,
    /// 原始链接，逐字节保留
    pub raw_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(default)]
    pub latency: Latency,
    #[serde(default = "default_available")]
    pub is_available: bool,
    /// 毫秒时间戳
    #[serde(default)]
    pub last_tested_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_test_status: Option<AutoTestStatus>,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_available() -> bool {
    true
}

const REGIONAL_A: u32 = 0x1F1E6;
const REGIONAL_Z: u32 = 0x1F1FF;

fn is_regional(c: char) -> bool {
    (REGIONAL_A..=REGIONAL_Z).contains(&(c as u32))
}

impl NodeRecord {
    /// 构造一个尚未测量的节点
    pub fn new(
        id: String,
        name: String,
        node_type: NodeType,
        server: String,
        port: u16,
        raw_link: String,
    ) -> Self {
        Self {
            id,
            name,
            node_type,
            server,
            port,
            raw_link,
            country: None,
            country_name: None,
            latency: Latency::Untested,
            is_available: true,
            last_tested_at: 0,
            download_mbps: None,
            upload_mbps: None,
            unlock_summary: None,
            unlock_passed: None,
            auto_test_status: None,
            sort_order: 0,
        }
    }

    /// 国旗 emoji：优先取名称中的区域指示符对，其次由国家代码生成，最后回退 🌐
    pub fn flag_emoji(&self) -> String {
        let chars: Vec<char> = self.name.chars().collect();
        if let Some(pair) = chars
            .windows(2)
            .find(|w| is_regional(w[0]) && is_regional(w[1]))
        {
            return pair.iter().collect();
        }

        match self.country.as_deref() {
            Some(code) if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) => code
                .to_ascii_uppercase()
                .chars()
                .filter_map(|c| char::from_u32(c as u32 - 'A' as u32 + REGIONAL_A))
                .collect(),
            _ => "🌐".to_string(),
        }
    }

    /// 分区采样用的地区键 (两位国家代码或 `ZZ`)
    pub fn region_key(&self) -> String {
        let flag = self.flag_emoji();
        let code: String = flag
            .chars()
            .filter(|c| is_regional(*c))
            .filter_map(|c| char::from_u32(c as u32 - REGIONAL_A + 'A' as u32))
            .collect();
        if code.len() == 2 { code } else { "ZZ".to_string() }
    }

    pub fn latency_text(&self) -> String {
        match self.latency {
            Latency::Untested => "未测试".to_string(),
            Latency::Unreachable => "超时".to_string(),
            Latency::Measured(_) if !self.is_available => "不可用".to_string(),
            Latency::Measured(ms) => format!("{}ms", ms),
        }
    }

    pub fn latency_level(&self) -> LatencyLevel {
        match self.latency {
            Latency::Measured(ms) if self.is_available && ms < 100 => LatencyLevel::Good,
            Latency::Measured(ms) if self.is_available && ms < 300 => LatencyLevel::Medium,
            _ => LatencyLevel::Bad,
        }
    }
}

/// 代理模式
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ProxyMode {
    Global,
    #[default]
    Smart,
}

/// IPv6 路由模式
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Ipv6Mode {
    /// DNS 策略 prefer_ipv4，无 IPv6 地址
    #[default]
    Disabled,
    /// 双栈
    Enabled,
    /// DNS 策略 prefer_ipv6
    Prefer,
    /// 仅 IPv6，DNS 策略 ipv6_only
    Only,
}

/// 分应用代理模式
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PerAppMode {
    /// 只有列表中的应用走代理
    Whitelist,
    /// 列表中的应用绕过代理
    #[default]
    Blacklist,
}

/// 生成器输入，不持久化
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingOptions {
    pub selected_node_id: Option<String>,
    pub proxy_mode: ProxyMode,
    pub bypass_lan: bool,
    pub ipv6_mode: Ipv6Mode,
    pub per_app_mode: PerAppMode,
    pub per_app_packages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeRecord {
        NodeRecord::new(
            "id".into(),
            name.into(),
            NodeType::Trojan,
            "example.com".into(),
            443,
            "trojan://x@example.com:443".into(),
        )
    }

    #[test]
    fn latency_legacy_encoding() {
        assert_eq!(Latency::from(-1), Latency::Untested);
        assert_eq!(Latency::from(-2), Latency::Unreachable);
        assert_eq!(Latency::from(87), Latency::Measured(87));
        assert_eq!(i64::from(Latency::Unreachable), -2);

        let json = serde_json::to_string(&Latency::Measured(42)).unwrap();
        assert_eq!(json, "42");
        let back: Latency = serde_json::from_str("-1").unwrap();
        assert_eq!(back, Latency::Untested);
    }

    #[test]
    fn flag_from_name_then_country() {
        let n = node("🇯🇵 Tokyo 01");
        assert_eq!(n.flag_emoji(), "🇯🇵");
        assert_eq!(n.region_key(), "JP");

        let mut n = node("plain");
        assert_eq!(n.flag_emoji(), "🌐");
        assert_eq!(n.region_key(), "ZZ");
        n.country = Some("us".into());
        assert_eq!(n.flag_emoji(), "🇺🇸");
        assert_eq!(n.region_key(), "US");
    }

    #[test]
    fn latency_levels() {
        let mut n = node("a");
        n.latency = Latency::Measured(99);
        assert_eq!(n.latency_level(), LatencyLevel::Good);
        n.latency = Latency::Measured(100);
        assert_eq!(n.latency_level(), LatencyLevel::Medium);
        n.latency = Latency::Measured(300);
        assert_eq!(n.latency_level(), LatencyLevel::Bad);
        n.latency = Latency::Unreachable;
        assert_eq!(n.latency_level(), LatencyLevel::Bad);
        assert_eq!(n.latency_text(), "超时");
    }

    #[test]
    fn node_type_from_link_prefix() {
        assert_eq!(NodeType::from_link("HY2://x@h:1"), NodeType::Hysteria2);
        assert_eq!(NodeType::from_link("socks5://h:1"), NodeType::Socks);
        assert_eq!(NodeType::from_link("tuic://h:1"), NodeType::Unknown);
    }
}
