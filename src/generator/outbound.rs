//! 出站定义 (Outbound Definitions)
//!
//! sing-box 出站的强类型表示，以及 [`ProxyLink`] 到出站的逐协议转换。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::error::LinkError;
use crate::utils::link::{Protocol, ProxyLink, TlsParams, TransportParams};

/// 支持的出站变体 (Outbound Variants)
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Selector {
        tag: String,
        outbounds: Vec<String>,
        default: String,
    },
    Urltest {
        tag: String,
        outbounds: Vec<String>,
        url: String,
        interval: String,
        tolerance: u32,
        interrupt_exist_connections: bool,
    },
    Vless {
        tag: String,
        server: String,
        server_port: u16,
        uuid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<TlsOutbound>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<V2RayTransport>,
    },
    Vmess {
        tag: String,
        server: String,
        server_port: u16,
        uuid: String,
        security: String,
        alter_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<TlsOutbound>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<V2RayTransport>,
    },
    Trojan {
        tag: String,
        server: String,
        server_port: u16,
        password: String,
        tls: TlsOutbound,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<V2RayTransport>,
    },
    Hysteria2 {
        tag: String,
        server: String,
        server_port: u16,
        password: String,
        tls: TlsOutbound,
        #[serde(skip_serializing_if = "Option::is_none")]
        obfs: Option<Obfs>,
    },
    Shadowsocks {
        tag: String,
        server: String,
        server_port: u16,
        method: String,
        password: String,
    },
    Socks {
        tag: String,
        server: String,
        server_port: u16,
        version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Http {
        tag: String,
        server: String,
        server_port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<TlsOutbound>,
    },
    Direct {
        tag: String,
    },
    Block {
        tag: String,
    },
    Dns {
        tag: String,
    },
}

impl Outbound {
    pub fn tag(&self) -> &str {
        match self {
            Outbound::Selector { tag, .. }
            | Outbound::Urltest { tag, .. }
            | Outbound::Vless { tag, .. }
            | Outbound::Vmess { tag, .. }
            | Outbound::Trojan { tag, .. }
            | Outbound::Hysteria2 { tag, .. }
            | Outbound::Shadowsocks { tag, .. }
            | Outbound::Socks { tag, .. }
            | Outbound::Http { tag, .. }
            | Outbound::Direct { tag }
            | Outbound::Block { tag }
            | Outbound::Dns { tag } => tag,
        }
    }

    pub fn direct() -> Self {
        Outbound::Direct {
            tag: "direct".to_string(),
        }
    }
}

/// 传输层封装协议 (Transport Layer)
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum V2RayTransport {
    #[serde(rename = "http")]
    Http {
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<Vec<String>>,
        path: String,
    },
    #[serde(rename = "ws")]
    Websocket {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
    },
    #[serde(rename = "grpc")]
    Grpc { service_name: String },
    #[serde(rename = "httpupgrade")]
    HttpUpgrade {
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        path: String,
    },
    #[serde(rename = "quic")]
    Quic {},
}

/// 安全传输配置 (TLS/uTLS/Reality)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TlsOutbound {
    pub enabled: bool,
    pub server_name: String,
    pub insecure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utls: Option<UtlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityConfig>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UtlsConfig {
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RealityConfig {
    pub enabled: bool,
    pub public_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Obfs {
    #[serde(rename = "type")]
    pub kind: String,
    pub password: String,
}

fn tls_outbound(params: &TlsParams, server_name: String) -> TlsOutbound {
    TlsOutbound {
        enabled: true,
        server_name,
        insecure: params.insecure,
        alpn: (!params.alpn.is_empty()).then(|| params.alpn.clone()),
        utls: params.fingerprint.as_ref().map(|fp| UtlsConfig {
            enabled: true,
            fingerprint: fp.clone(),
        }),
        reality: None,
    }
}

fn transport(params: &TransportParams) -> Result<Option<V2RayTransport>, LinkError> {
    if params.is_plain() {
        return Ok(None);
    }
    let path = || params.path.clone().unwrap_or_else(|| "/".to_string());
    let t = match params.network.as_str() {
        "ws" | "websocket" => V2RayTransport::Websocket {
            path: path(),
            headers: params
                .host
                .as_ref()
                .map(|h| BTreeMap::from([("Host".to_string(), h.clone())])),
        },
        "grpc" => V2RayTransport::Grpc {
            service_name: params
                .service_name
                .clone()
                .or_else(|| params.path.clone())
                .unwrap_or_default(),
        },
        "http" | "h2" => V2RayTransport::Http {
            host: params.host.as_ref().map(|h| vec![h.clone()]),
            path: path(),
        },
        "httpupgrade" => V2RayTransport::HttpUpgrade {
            host: params.host.clone(),
            path: path(),
        },
        "quic" => V2RayTransport::Quic {},
        other => {
            return Err(LinkError::InvalidPayload(format!(
                "unsupported transport: {}",
                other
            )));
        }
    };
    Ok(Some(t))
}

/// 按协议构造节点出站，`tag` 覆盖为调用方指定的值
pub fn build_outbound(link: &ProxyLink, tag: &str) -> Result<Outbound, LinkError> {
    if link.server.is_empty() {
        return Err(LinkError::MissingHost);
    }
    let tag = tag.to_string();
    let server = link.server.clone();
    let server_port = link.port;

    let outbound = match &link.protocol {
        Protocol::Vless(p) => {
            let tls = p.tls.as_ref().map(|t| {
                let sni = t
                    .sni
                    .clone()
                    .or_else(|| p.transport.host.clone())
                    .unwrap_or_else(|| server.clone());
                let mut tls = tls_outbound(t, sni);
                if let Some(r) = &p.reality {
                    tls.reality = Some(RealityConfig {
                        enabled: true,
                        public_key: r.public_key.clone(),
                        short_id: r.short_id.clone(),
                    });
                    // Reality 必须带 uTLS 指纹
                    tls.utls = Some(UtlsConfig {
                        enabled: true,
                        fingerprint: t.fingerprint.clone().unwrap_or_else(|| "chrome".into()),
                    });
                }
                tls
            });
            Outbound::Vless {
                tag,
                server,
                server_port,
                uuid: p.uuid.clone(),
                flow: p.flow.clone(),
                tls,
                transport: transport(&p.transport)?,
            }
        }
        Protocol::Vmess(p) => Outbound::Vmess {
            tls: p
                .tls
                .as_ref()
                .map(|t| tls_outbound(t, t.sni.clone().unwrap_or_else(|| server.clone()))),
            transport: transport(&p.transport)?,
            tag,
            server,
            server_port,
            uuid: p.uuid.clone(),
            security: p.security.clone(),
            alter_id: p.alter_id,
        },
        Protocol::Trojan(p) => Outbound::Trojan {
            tls: tls_outbound(&p.tls, p.tls.sni.clone().unwrap_or_else(|| server.clone())),
            transport: transport(&p.transport)?,
            tag,
            server,
            server_port,
            password: p.password.clone(),
        },
        Protocol::Hysteria2(p) => Outbound::Hysteria2 {
            tls: tls_outbound(&p.tls, p.tls.sni.clone().unwrap_or_else(|| server.clone())),
            obfs: p.obfs.as_ref().map(|kind| Obfs {
                kind: kind.clone(),
                password: p.obfs_password.clone().unwrap_or_default(),
            }),
            tag,
            server,
            server_port,
            password: p.password.clone(),
        },
        Protocol::Shadowsocks(p) => Outbound::Shadowsocks {
            tag,
            server,
            server_port,
            method: p.method.clone(),
            password: p.password.clone(),
        },
        Protocol::Socks(p) => Outbound::Socks {
            tag,
            server,
            server_port,
            version: p.version.clone(),
            username: p.username.clone(),
            password: p.password.clone(),
        },
        Protocol::Http(p) => Outbound::Http {
            tls: p.tls.then(|| TlsOutbound {
                enabled: true,
                server_name: server.clone(),
                insecure: false,
                alpn: None,
                utls: None,
                reality: None,
            }),
            tag,
            server,
            server_port,
            username: p.username.clone(),
            password: p.password.clone(),
        },
    };
    Ok(outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outbound_json(raw: &str) -> serde_json::Value {
        let link = ProxyLink::parse(raw).unwrap();
        serde_json::to_value(build_outbound(&link, "node-1").unwrap()).unwrap()
    }

    #[test]
    fn vless_reality_outbound() {
        let v = outbound_json(
            "vless://uuid-1@1.1.1.1:443?security=reality&sni=www.apple.com&pbk=KEY&sid=ab&type=tcp&flow=xtls-rprx-vision#r",
        );
        assert_eq!(
            v,
            json!({
                "type": "vless",
                "tag": "node-1",
                "server": "1.1.1.1",
                "server_port": 443,
                "uuid": "uuid-1",
                "flow": "xtls-rprx-vision",
                "tls": {
                    "enabled": true,
                    "server_name": "www.apple.com",
                    "insecure": false,
                    "utls": { "enabled": true, "fingerprint": "chrome" },
                    "reality": { "enabled": true, "public_key": "KEY", "short_id": "ab" }
                }
            })
        );
    }

    #[test]
    fn vless_ws_uses_host_for_sni() {
        let v = outbound_json(
            "vless://u@edge.example:443?security=tls&type=ws&host=cdn.example&path=%2Fray&allowInsecure=1",
        );
        assert_eq!(v["tls"]["server_name"], "cdn.example");
        assert_eq!(v["tls"]["insecure"], true);
        assert_eq!(
            v["transport"],
            json!({ "type": "ws", "path": "/ray", "headers": { "Host": "cdn.example" } })
        );
    }

    #[test]
    fn trojan_always_tls() {
        let v = outbound_json("trojan://pw@t.example:443#t");
        assert_eq!(v["tls"]["enabled"], true);
        assert_eq!(v["tls"]["server_name"], "t.example");
        assert!(v.get("transport").is_none());
    }

    #[test]
    fn hysteria2_obfs() {
        let v = outbound_json("hysteria2://pw@h.example:443?obfs=salamander&obfs-password=o&insecure=1");
        assert_eq!(v["obfs"], json!({ "type": "salamander", "password": "o" }));
        assert_eq!(v["tls"]["insecure"], true);
    }

    #[test]
    fn socks_without_credentials() {
        let v = outbound_json("socks5://s.example:1080");
        assert_eq!(
            v,
            json!({
                "type": "socks",
                "tag": "node-1",
                "server": "s.example",
                "server_port": 1080,
                "version": "5"
            })
        );
    }

    #[test]
    fn https_proxy_enables_tls() {
        let v = outbound_json("https://u:p@p.example:8443");
        assert_eq!(v["tls"]["server_name"], "p.example");
        assert_eq!(v["username"], "u");
        assert_eq!(v["password"], "p");
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let link = ProxyLink::parse("vless://u@h.example:443?type=kcp").unwrap();
        assert!(build_outbound(&link, "x").is_err());
    }
}
