//! DNS 与路由规则 (DNS & Route Rules)
//!
//! 节点服务器地址分类 (IP 字面量 / 域名) 驱动防回环规则：
//! 代理自身的上游地址永远不能再经由代理解析或转发。

use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::Regex;
use serde::Serialize;

use crate::core::model::{Ipv6Mode, NodeRecord, ProxyMode};

static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)$",
    )
    .expect("static IPv4 regex")
});

/// 国内常见服务域名后缀 (SMART 模式直连)
pub const DOMESTIC_SUFFIXES: &[&str] = &[
    "cn",
    // Bilibili
    "bilibili.com", "bilivideo.com", "bilivideo.cn", "biliapi.com", "biliapi.net", "hdslb.com",
    // Alibaba
    "alibaba.com", "alibabagroup.com", "alicdn.com", "alikunlun.com", "alipay.com",
    "alipayobjects.com", "aliyun.com", "aliyuncdn.com", "aliyuncs.com", "mmstat.com", "tanx.com",
    "taobao.com", "tmall.com",
    // Tencent
    "qq.com", "tencent.com", "weixin.com", "wechat.com", "qzone.com", "qcloud.com", "myqcloud.com",
    "gtimg.com", "qpic.cn", "qlogo.cn", "weixinbridge.com",
    // ByteDance
    "bytedance.com", "douyin.com", "douyinpic.com", "douyinvod.com", "idouyinvod.com", "snssdk.com",
    "pstatp.com", "ixigua.com", "byteimg.com", "toutiao.com", "toutiaocloud.com",
    // NetEase
    "163.com", "126.net", "127.net", "netease.com", "music.126.net", "ydstatic.com",
    // Baidu
    "baidu.com", "baidustatic.com", "bdstatic.com", "bdimg.com", "bcebos.com",
    // Xiaomi
    "mi.com", "xiaomi.com", "xiaomiyoupin.com",
    // JD
    "jd.com", "jd.hk", "360buy.com", "360buyimg.com",
    // 其他
    "zhihu.com", "zhimg.com", "weibo.com", "sina.com.cn", "sinajs.cn", "xiaohongshu.com",
    "xhscdn.com", "meituan.com", "dianping.com", "ele.me", "360.cn", "360.com", "sohu.com",
    "sogou.com", "xunlei.com", "csdn.net", "cnblogs.com", "oschina.net", "gitee.com", "amap.com",
    "autonavi.com", "gaode.com", "iqiyi.com", "iqiyipic.com", "71.am", "youku.com", "ip138.com",
    "bce.baidu.com",
];

/// 私有网段与国内公共 DNS (SMART 模式直连)
pub const DOMESTIC_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "fc00::/7",
    "fe80::/10",
    "223.5.5.5/32",
    "223.6.6.6/32",
    "119.29.29.29/32",
    "114.114.114.114/32",
    "180.76.76.76/32",
];

/// 点分 IPv4，或含冒号 (粗略视为 IPv6)
pub fn is_ip_literal(server: &str) -> bool {
    IPV4_RE.is_match(server) || server.contains(':')
}

/// 节点服务器地址分类结果，保持首次出现的顺序
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServerClasses {
    pub domains: Vec<String>,
    pub ips: Vec<String>,
}

impl ServerClasses {
    pub fn classify<'a>(servers: impl IntoIterator<Item = &'a str>) -> Self {
        let distinct: IndexSet<&str> = servers.into_iter().filter(|s| !s.is_empty()).collect();
        let (ips, domains): (Vec<&str>, Vec<&str>) =
            distinct.into_iter().partition(|s| is_ip_literal(s));
        Self {
            domains: domains.into_iter().map(String::from).collect(),
            ips: ips.into_iter().map(String::from).collect(),
        }
    }

    pub fn from_nodes(nodes: &[NodeRecord]) -> Self {
        Self::classify(nodes.iter().map(|n| n.server.as_str()))
    }

    /// IP 字面量转为主机 CIDR，IPv6 去掉方括号
    pub fn ip_cidrs(&self) -> Vec<String> {
        self.ips
            .iter()
            .map(|ip| {
                if ip.contains(':') {
                    format!("{}/128", ip.replace(['[', ']'], ""))
                } else {
                    format!("{}/32", ip)
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    pub detour: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct DnsRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_suffix: Option<Vec<String>>,
    pub server: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DnsConfig {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<DnsRule>,
    #[serde(rename = "final")]
    pub final_server: String,
    pub strategy: String,
}

pub const DNS_REMOTE: &str = "remote";
pub const DNS_LOCAL: &str = "local";

fn dns_strategy(mode: Ipv6Mode) -> &'static str {
    match mode {
        Ipv6Mode::Only => "ipv6_only",
        Ipv6Mode::Prefer => "prefer_ipv6",
        Ipv6Mode::Disabled | Ipv6Mode::Enabled => "prefer_ipv4",
    }
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// DNS 块：节点地址经本地解析器，SMART 模式的国内域名同样本地，其余走远端
pub fn dns_config(mode: ProxyMode, classes: &ServerClasses, ipv6: Ipv6Mode) -> DnsConfig {
    let mut rules = Vec::new();

    // 节点自身地址一律本地解析，IP 字面量一并列出
    let own: Vec<String> = classes
        .domains
        .iter()
        .chain(classes.ips.iter())
        .map(|s| s.replace(['[', ']'], ""))
        .collect();
    if !own.is_empty() {
        rules.push(DnsRule {
            domain: Some(own),
            server: DNS_LOCAL.to_string(),
            ..Default::default()
        });
    }

    if mode == ProxyMode::Smart {
        rules.push(DnsRule {
            domain_suffix: Some(owned(DOMESTIC_SUFFIXES)),
            server: DNS_LOCAL.to_string(),
            ..Default::default()
        });
    }

    DnsConfig {
        servers: vec![
            DnsServer {
                tag: DNS_REMOTE.to_string(),
                address: "tls://8.8.8.8".to_string(),
                detour: "proxy".to_string(),
            },
            DnsServer {
                tag: DNS_LOCAL.to_string(),
                address: "223.5.5.5".to_string(),
                detour: "direct".to_string(),
            },
        ],
        rules,
        final_server: DNS_REMOTE.to_string(),
        strategy: dns_strategy(ipv6).to_string(),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct RouteRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_suffix: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_cidr: Option<Vec<String>>,
    pub outbound: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteConfig {
    pub rules: Vec<RouteRule>,
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub auto_detect_interface: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_interface: Option<String>,
}

fn direct_rule(rule: RouteRule) -> RouteRule {
    RouteRule {
        outbound: "direct".to_string(),
        ..rule
    }
}

/// 路由块，首条命中生效，兜底为 `proxy`
pub fn route_config(mode: ProxyMode, classes: &ServerClasses, bypass_lan: bool) -> RouteConfig {
    let mut rules = vec![RouteRule {
        protocol: Some("dns".to_string()),
        outbound: "dns-out".to_string(),
        ..Default::default()
    }];

    if bypass_lan {
        rules.push(direct_rule(RouteRule {
            ip_is_private: Some(true),
            ..Default::default()
        }));
    }

    if !classes.domains.is_empty() {
        rules.push(direct_rule(RouteRule {
            domain: Some(classes.domains.clone()),
            ..Default::default()
        }));
    }

    if mode == ProxyMode::Smart {
        rules.push(direct_rule(RouteRule {
            domain_suffix: Some(owned(DOMESTIC_SUFFIXES)),
            ..Default::default()
        }));
        rules.push(direct_rule(RouteRule {
            ip_cidr: Some(owned(DOMESTIC_CIDRS)),
            ..Default::default()
        }));
    }

    if !classes.ips.is_empty() {
        rules.push(direct_rule(RouteRule {
            ip_cidr: Some(classes.ip_cidrs()),
            ..Default::default()
        }));
    }

    RouteConfig {
        rules,
        final_outbound: "proxy".to_string(),
        auto_detect_interface: true,
        default_interface: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let c = ServerClasses::classify([
            "1.2.3.4",
            "a.example.com",
            "2001:db8::1",
            "[2001:db8::2]",
            "1.2.3.4",
            "256.1.1.1",
            "",
        ]);
        assert_eq!(c.domains, vec!["a.example.com", "256.1.1.1"]);
        assert_eq!(c.ips, vec!["1.2.3.4", "2001:db8::1", "[2001:db8::2]"]);
        assert_eq!(
            c.ip_cidrs(),
            vec!["1.2.3.4/32", "2001:db8::1/128", "2001:db8::2/128"]
        );
    }

    #[test]
    fn global_route_has_no_domestic_rules() {
        let c = ServerClasses::classify(["1.2.3.4"]);
        let r = route_config(ProxyMode::Global, &c, false);
        assert_eq!(r.rules.len(), 2);
        assert_eq!(r.rules[0].protocol.as_deref(), Some("dns"));
        assert_eq!(r.rules[1].ip_cidr, Some(vec!["1.2.3.4/32".to_string()]));
        assert_eq!(r.final_outbound, "proxy");
    }

    #[test]
    fn dns_strategy_follows_ipv6_mode() {
        let c = ServerClasses::default();
        assert_eq!(dns_config(ProxyMode::Global, &c, Ipv6Mode::Only).strategy, "ipv6_only");
        assert_eq!(dns_config(ProxyMode::Global, &c, Ipv6Mode::Prefer).strategy, "prefer_ipv6");
        assert_eq!(dns_config(ProxyMode::Global, &c, Ipv6Mode::Enabled).strategy, "prefer_ipv4");
        assert!(dns_config(ProxyMode::Global, &c, Ipv6Mode::Disabled).rules.is_empty());
    }

    #[test]
    fn smart_dns_keeps_node_rule_first() {
        let c = ServerClasses::classify(["n.example.com"]);
        let d = dns_config(ProxyMode::Smart, &c, Ipv6Mode::Disabled);
        assert_eq!(d.rules[0].domain, Some(vec!["n.example.com".to_string()]));
        assert_eq!(d.rules[0].server, DNS_LOCAL);
        assert!(d.rules[1].domain_suffix.as_ref().unwrap().contains(&"cn".to_string()));
        assert_eq!(d.final_server, DNS_REMOTE);
    }
}
