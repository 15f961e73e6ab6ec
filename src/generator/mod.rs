//! sing-box 配置生成器 (Config Generator)
//!
//! 从节点列表与路由选项合成完整、可独立加载的 JSON 配置文档。
//! 生成过程不做任何 I/O。每个节点的出站都由其原始链接重新解析得到；
//! 无法重新解析的节点会被跳过并记录警告，其余部分照常生成。

pub mod outbound;
pub mod route;

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::error::{LinkError, Result};
use crate::core::model::{Ipv6Mode, NodeRecord, PerAppMode, RoutingOptions};
use crate::utils::link::ProxyLink;

pub use outbound::{Outbound, build_outbound};
pub use route::{DnsConfig, RouteConfig, ServerClasses, is_ip_literal};

pub const SELECTOR_TAG: &str = "proxy";
pub const URLTEST_TAG: &str = "auto";
pub const HEALTH_CHECK_URL: &str = "https://www.google.com/generate_204";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogConfig {
    pub level: String,
    pub timestamp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TunInbound {
    pub tag: String,
    pub interface_name: String,
    pub inet4_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inet6_address: Option<String>,
    pub mtu: u32,
    pub auto_route: bool,
    pub strict_route: bool,
    pub route_address: Vec<String>,
    pub stack: String,
    pub sniff: bool,
    pub sniff_override_destination: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_package: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_package: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Tun(TunInbound),
    Socks {
        tag: String,
        listen: String,
        listen_port: u16,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheFile {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClashApi {
    pub external_controller: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Experimental {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<CacheFile>,
    pub clash_api: ClashApi,
}

/// 生成的完整配置文档
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfigDocument {
    pub log: LogConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Experimental>,
}

impl ConfigDocument {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn log_config(level: &str, output: Option<&str>) -> LogConfig {
    LogConfig {
        level: level.to_string(),
        timestamp: true,
        output: output.map(String::from),
    }
}

/// TUN 入站：IPv4 地址始终存在，IPv6 地址与 `::/0` 仅在启用时添加
fn tun_inbound(ipv6: Ipv6Mode, per_app: Option<(PerAppMode, &[String])>) -> Inbound {
    let mut route_address = Vec::new();
    if ipv6 != Ipv6Mode::Only {
        route_address.push("0.0.0.0/0".to_string());
    }
    if ipv6 != Ipv6Mode::Disabled {
        route_address.push("::/0".to_string());
    }

    let (include_package, exclude_package) = match per_app {
        Some((_, packages)) if packages.is_empty() => (None, None),
        Some((PerAppMode::Whitelist, packages)) => (Some(packages.to_vec()), None),
        Some((PerAppMode::Blacklist, packages)) => (None, Some(packages.to_vec())),
        None => (None, None),
    };

    Inbound::Tun(TunInbound {
        tag: "tun-in".to_string(),
        interface_name: "tun0".to_string(),
        inet4_address: "172.19.0.1/30".to_string(),
        inet6_address: (ipv6 != Ipv6Mode::Disabled).then(|| "2001:db8::1/126".to_string()),
        mtu: 9000,
        auto_route: true,
        strict_route: true,
        route_address,
        stack: "gvisor".to_string(),
        sniff: true,
        sniff_override_destination: true,
        include_package,
        exclude_package,
    })
}

/// 逐节点构造出站，失败的节点被跳过；同一 id 只保留第一次出现
fn node_outbounds(nodes: &[NodeRecord]) -> Vec<(String, Outbound)> {
    let mut seen = HashSet::with_capacity(nodes.len());
    nodes
        .iter()
        .filter(|node| {
            let first = seen.insert(node.id.as_str());
            if !first {
                debug!("忽略重复节点 {} ({})", node.name, node.id);
            }
            first
        })
        .filter_map(|node| {
            let built = ProxyLink::parse(&node.raw_link)
                .and_then(|link| build_outbound(&link, &node.id));
            match built {
                Ok(outbound) => Some((node.id.clone(), outbound)),
                Err(e) => {
                    warn!("跳过节点 {} ({}): {}", node.name, node.id, e);
                    None
                }
            }
        })
        .collect()
}

/// 空节点列表时的最小可加载文档
pub fn empty_config() -> ConfigDocument {
    ConfigDocument {
        log: log_config("info", None),
        dns: None,
        inbounds: vec![tun_inbound(Ipv6Mode::Disabled, None)],
        outbounds: vec![Outbound::direct()],
        route: None,
        experimental: None,
    }
}

/// 生成完整配置
pub fn generate(nodes: &[NodeRecord], options: &RoutingOptions) -> ConfigDocument {
    let built = node_outbounds(nodes);
    if built.is_empty() {
        return empty_config();
    }

    let classes = ServerClasses::from_nodes(nodes);
    let ids: Vec<String> = built.iter().map(|(id, _)| id.clone()).collect();

    let default = options
        .selected_node_id
        .as_ref()
        .filter(|sel| ids.contains(sel))
        .cloned()
        .unwrap_or_else(|| URLTEST_TAG.to_string());

    let mut outbounds = Vec::with_capacity(ids.len() + 5);
    outbounds.push(Outbound::Selector {
        tag: SELECTOR_TAG.to_string(),
        outbounds: std::iter::once(URLTEST_TAG.to_string())
            .chain(ids.iter().cloned())
            .collect(),
        default,
    });
    outbounds.push(Outbound::Urltest {
        tag: URLTEST_TAG.to_string(),
        outbounds: ids,
        url: HEALTH_CHECK_URL.to_string(),
        interval: "10m".to_string(),
        tolerance: 50,
        interrupt_exist_connections: false,
    });
    outbounds.extend(built.into_iter().map(|(_, o)| o));
    outbounds.push(Outbound::direct());
    outbounds.push(Outbound::Block {
        tag: "block".to_string(),
    });
    outbounds.push(Outbound::Dns {
        tag: "dns-out".to_string(),
    });

    ConfigDocument {
        log: log_config("info", None),
        dns: Some(route::dns_config(
            options.proxy_mode,
            &classes,
            options.ipv6_mode,
        )),
        inbounds: vec![tun_inbound(
            options.ipv6_mode,
            Some((options.per_app_mode, options.per_app_packages.as_slice())),
        )],
        outbounds,
        route: Some(route::route_config(
            options.proxy_mode,
            &classes,
            options.bypass_lan,
        )),
        experimental: Some(Experimental {
            cache_file: Some(CacheFile { enabled: true }),
            clash_api: ClashApi {
                external_controller: "127.0.0.1:9090".to_string(),
            },
        }),
    }
}

/// 单节点验证配置：仅 SOCKS 入站，节点出站 tag 固定为 `proxy`
pub fn generate_test_config(
    node: &NodeRecord,
    local_port: u16,
) -> std::result::Result<ConfigDocument, LinkError> {
    let link = ProxyLink::parse(&node.raw_link)?;
    let proxy = build_outbound(&link, SELECTOR_TAG)?;

    Ok(ConfigDocument {
        log: LogConfig {
            level: "error".to_string(),
            timestamp: false,
            output: None,
        },
        dns: None,
        inbounds: vec![Inbound::Socks {
            tag: "socks-in".to_string(),
            listen: "127.0.0.1".to_string(),
            listen_port: local_port,
        }],
        outbounds: vec![proxy, Outbound::direct()],
        route: None,
        experimental: None,
    })
}

/// 无 TUN 的测速配置：仅出站与 clash API，用于免权限的批量延迟测试
pub fn generate_url_test_config(
    nodes: &[NodeRecord],
    api_port: u16,
    bind_interface: Option<&str>,
    log_path: Option<&str>,
) -> ConfigDocument {
    let mut outbounds: Vec<Outbound> = node_outbounds(nodes).into_iter().map(|(_, o)| o).collect();
    outbounds.push(Outbound::direct());

    ConfigDocument {
        log: log_config("warn", log_path),
        dns: None,
        inbounds: Vec::new(),
        outbounds,
        route: Some(RouteConfig {
            rules: Vec::new(),
            final_outbound: "direct".to_string(),
            auto_detect_interface: bind_interface.is_none(),
            default_interface: bind_interface.map(String::from),
        }),
        experimental: Some(Experimental {
            cache_file: None,
            clash_api: ClashApi {
                external_controller: format!("127.0.0.1:{}", api_port),
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ProxyMode;
    use crate::utils::link::parse_link;
    use serde_json::{Value, json};

    fn nodes(links: &[&str]) -> Vec<NodeRecord> {
        links.iter().map(|l| parse_link(l).unwrap()).collect()
    }

    fn to_value(doc: &ConfigDocument) -> Value {
        serde_json::from_str(&doc.to_json().unwrap()).unwrap()
    }

    #[test]
    fn empty_input_yields_direct_only() {
        let v = to_value(&generate(&[], &RoutingOptions::default()));
        assert_eq!(v["outbounds"], json!([{ "type": "direct", "tag": "direct" }]));
        assert!(v.get("route").is_none());
        assert!(v.get("dns").is_none());
    }

    #[test]
    fn selector_defaults_to_auto_unless_selected_present() {
        let list = nodes(&["trojan://a@a.example.com:443#A", "trojan://b@b.example.com:443#B"]);
        let mut opts = RoutingOptions::default();
        opts.selected_node_id = Some("missing".into());
        let doc = generate(&list, &opts);
        let Outbound::Selector { outbounds, default, .. } = &doc.outbounds[0] else {
            panic!("selector first");
        };
        assert_eq!(default, "auto");
        assert_eq!(outbounds[0], "auto");
        assert_eq!(outbounds[1..], [list[0].id.clone(), list[1].id.clone()]);

        opts.selected_node_id = Some(list[1].id.clone());
        let doc = generate(&list, &opts);
        let Outbound::Selector { default, .. } = &doc.outbounds[0] else {
            panic!("selector first");
        };
        assert_eq!(default, &list[1].id);
    }

    #[test]
    fn outbound_order_and_fixed_tags() {
        let list = nodes(&["trojan://a@1.2.3.4:443#A"]);
        let doc = generate(&list, &RoutingOptions::default());
        let tags: Vec<&str> = doc.outbounds.iter().map(|o| o.tag()).collect();
        assert_eq!(tags, vec!["proxy", "auto", list[0].id.as_str(), "direct", "block", "dns-out"]);

        let v = to_value(&doc);
        assert_eq!(v["outbounds"][1]["interval"], "10m");
        assert_eq!(v["outbounds"][1]["tolerance"], 50);
        assert_eq!(v["experimental"]["clash_api"]["external_controller"], "127.0.0.1:9090");
    }

    #[test]
    fn tun_addresses_follow_ipv6_mode() {
        let list = nodes(&["trojan://a@1.2.3.4:443#A"]);
        let mut opts = RoutingOptions::default();

        let v = to_value(&generate(&list, &opts));
        let tun = &v["inbounds"][0];
        assert_eq!(tun["inet4_address"], "172.19.0.1/30");
        assert!(tun.get("inet6_address").is_none());
        assert_eq!(tun["route_address"], json!(["0.0.0.0/0"]));

        opts.ipv6_mode = Ipv6Mode::Only;
        let v = to_value(&generate(&list, &opts));
        let tun = &v["inbounds"][0];
        assert_eq!(tun["inet4_address"], "172.19.0.1/30");
        assert_eq!(tun["inet6_address"], "2001:db8::1/126");
        assert_eq!(tun["route_address"], json!(["::/0"]));
        assert_eq!(v["dns"]["strategy"], "ipv6_only");
    }

    #[test]
    fn per_app_lists_map_to_packages() {
        let list = nodes(&["trojan://a@1.2.3.4:443#A"]);
        let opts = RoutingOptions {
            per_app_mode: PerAppMode::Whitelist,
            per_app_packages: vec!["org.example.browser".into()],
            ..Default::default()
        };
        let v = to_value(&generate(&list, &opts));
        assert_eq!(v["inbounds"][0]["include_package"], json!(["org.example.browser"]));
        assert!(v["inbounds"][0].get("exclude_package").is_none());
    }

    #[test]
    fn broken_node_is_skipped() {
        let mut list = nodes(&["trojan://a@a.example.com:443#A", "trojan://b@b.example.com:443#B"]);
        list[1].raw_link = "vmess://!!!".into();
        let doc = generate(&list, &RoutingOptions::default());
        let Outbound::Urltest { outbounds, .. } = &doc.outbounds[1] else {
            panic!("urltest second");
        };
        assert_eq!(outbounds, &vec![list[0].id.clone()]);
        assert_eq!(doc.outbounds.len(), 6);

        list.truncate(1);
        list[0].raw_link = "nonsense".into();
        assert_eq!(generate(&list, &RoutingOptions::default()), empty_config());
    }

    #[test]
    fn duplicate_ids_emit_one_outbound() {
        let list = nodes(&[
            "trojan://a@a.example.com:443#A",
            "trojan://b@b.example.com:443#B",
            "trojan://a@a.example.com:443#A",
        ]);
        assert_eq!(list[0].id, list[2].id);

        let doc = generate(&list, &RoutingOptions::default());
        let v = to_value(&doc);
        let tags: Vec<&str> = v["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|o| o["tag"].as_str())
            .collect();
        let unique: HashSet<&str> = tags.iter().copied().collect();
        assert_eq!(tags.len(), unique.len());
        assert_eq!(doc.outbounds.len(), 7);
        let Outbound::Urltest { outbounds, .. } = &doc.outbounds[1] else {
            panic!("urltest second");
        };
        assert_eq!(outbounds, &vec![list[0].id.clone(), list[1].id.clone()]);

        let url_doc = generate_url_test_config(&list, 19090, None, None);
        assert_eq!(url_doc.outbounds.len(), 3);
    }

    #[test]
    fn test_config_uses_socks_inbound() {
        let node = parse_link("ss://YWVzLTI1Ni1nY206cHc=@9.9.9.9:8388#S").unwrap();
        let v = to_value(&generate_test_config(&node, 10808).unwrap());
        assert_eq!(
            v["inbounds"],
            json!([{ "type": "socks", "tag": "socks-in", "listen": "127.0.0.1", "listen_port": 10808 }])
        );
        assert_eq!(v["outbounds"][0]["tag"], "proxy");
        assert_eq!(v["outbounds"][0]["method"], "aes-256-gcm");
        assert_eq!(v["log"]["level"], "error");
    }

    #[test]
    fn url_test_config_has_no_tun() {
        let list = nodes(&["trojan://a@a.example.com:443#A"]);
        let v = to_value(&generate_url_test_config(&list, 19090, Some("eth0"), None));
        assert!(v.get("inbounds").is_none());
        assert_eq!(v["route"]["default_interface"], "eth0");
        assert_eq!(v["route"]["auto_detect_interface"], false);
        assert_eq!(v["experimental"]["clash_api"]["external_controller"], "127.0.0.1:19090");
        assert_eq!(v["outbounds"][0]["tag"], list[0].id);
    }

    #[test]
    fn smart_mode_outbounds_serialize() {
        let list = nodes(&["trojan://a@a.example.com:443#A"]);
        let opts = RoutingOptions {
            proxy_mode: ProxyMode::Smart,
            bypass_lan: true,
            ..Default::default()
        };
        let v = to_value(&generate(&list, &opts));
        assert_eq!(v["route"]["final"], "proxy");
        assert_eq!(v["route"]["rules"][0], json!({ "protocol": "dns", "outbound": "dns-out" }));
    }
}
