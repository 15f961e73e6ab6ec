//! 代理链接解析 (Proxy Link Parser)
//!
//! 将 `vless://`、`vmess://`、`trojan://`、`hysteria2://`、`ss://`、`socks://`、`http(s)://`
//! 链接解析为结构化的 [`ProxyLink`]，并据此构造 [`NodeRecord`]。
//! 原始链接是唯一可信来源，生成配置时会重新解析。

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use serde_json::Value;
use url::{Host, Url};

use crate::core::error::LinkError;
use crate::core::model::{NodeRecord, NodeType};
use crate::utils::{decode_base64_text, md5_hex};

/// 解析后的链接：公共端点信息 + 协议参数
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyLink {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// 各协议的专有参数
#[derive(Debug, Clone, PartialEq)]
pub enum Protocol {
    Vless(VlessParams),
    Vmess(VmessParams),
    Trojan(TrojanParams),
    Hysteria2(Hysteria2Params),
    Shadowsocks(ShadowsocksParams),
    Socks(SocksParams),
    Http(HttpParams),
}

/// 传输层参数 (ws / grpc / http / h2 / httpupgrade)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportParams {
    /// 缺省为 `tcp`
    pub network: String,
    pub path: Option<String>,
    pub host: Option<String>,
    pub service_name: Option<String>,
}

impl TransportParams {
    /// tcp / none 不需要 transport 块
    pub fn is_plain(&self) -> bool {
        matches!(self.network.as_str(), "" | "tcp" | "none")
    }

    fn from_query(q: &HashMap<String, String>) -> Self {
        Self {
            network: q.get("type").cloned().unwrap_or_else(|| "tcp".to_string()),
            path: q.get("path").cloned(),
            host: q.get("host").cloned(),
            service_name: q.get("serviceName").cloned(),
        }
    }
}

/// TLS / Reality 参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsParams {
    pub sni: Option<String>,
    pub insecure: bool,
    pub fingerprint: Option<String>,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealityParams {
    pub public_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VlessParams {
    pub uuid: String,
    pub flow: Option<String>,
    /// `security=tls|reality` 时存在
    pub tls: Option<TlsParams>,
    pub reality: Option<RealityParams>,
    pub transport: TransportParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmessParams {
    pub uuid: String,
    pub alter_id: u32,
    pub security: String,
    pub tls: Option<TlsParams>,
    pub transport: TransportParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrojanParams {
    pub password: String,
    pub tls: TlsParams,
    pub transport: TransportParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hysteria2Params {
    pub password: String,
    pub tls: TlsParams,
    pub obfs: Option<String>,
    pub obfs_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowsocksParams {
    pub method: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocksParams {
    /// `"4"` 或 `"5"`
    pub version: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpParams {
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyLink {
    /// 按协议前缀分派解析，首尾空白 (含全角空格) 先被去除
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let raw = raw.trim();
        match NodeType::from_link(raw) {
            NodeType::Vless => parse_vless(raw),
            NodeType::Vmess => parse_vmess(raw),
            NodeType::Trojan => parse_trojan(raw),
            NodeType::Hysteria2 => parse_hysteria2(raw),
            NodeType::Shadowsocks => parse_shadowsocks(raw),
            NodeType::Socks => parse_socks(raw),
            NodeType::Http => parse_http(raw),
            NodeType::Unknown => Err(LinkError::UnsupportedScheme(
                raw.split_once("://")
                    .map(|(s, _)| s.to_string())
                    .unwrap_or_default(),
            )),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.protocol {
            Protocol::Vless(_) => NodeType::Vless,
            Protocol::Vmess(_) => NodeType::Vmess,
            Protocol::Trojan(_) => NodeType::Trojan,
            Protocol::Hysteria2(_) => NodeType::Hysteria2,
            Protocol::Shadowsocks(_) => NodeType::Shadowsocks,
            Protocol::Socks(_) => NodeType::Socks,
            Protocol::Http(_) => NodeType::Http,
        }
    }

    /// 构造节点记录，id 为原始链接字节的 MD5
    pub fn into_record(self, raw: &str) -> NodeRecord {
        let node_type = self.node_type();
        NodeRecord::new(
            md5_hex(raw.as_bytes()),
            self.name,
            node_type,
            self.server,
            self.port,
            raw.to_string(),
        )
    }
}

/// 解析单条链接为节点记录；`raw_link` 与 id 都基于去除首尾空白后的链接
pub fn parse_link(raw: &str) -> Result<NodeRecord, LinkError> {
    let raw = raw.trim();
    ProxyLink::parse(raw).map(|link| link.into_record(raw))
}

// --- 公共辅助 ---

/// 去掉协议前缀 (不区分大小写) 后的载荷
fn strip_scheme<'a>(raw: &'a str, scheme: &str) -> Option<&'a str> {
    match raw.split_at_checked(scheme.len()) {
        Some((prefix, rest)) if prefix.eq_ignore_ascii_case(scheme) => Some(rest),
        _ => None,
    }
}

fn payload_after<'a>(raw: &'a str, scheme: &str) -> Result<&'a str, LinkError> {
    strip_scheme(raw, scheme)
        .ok_or_else(|| LinkError::InvalidPayload(format!("missing {} prefix", scheme)))
}

/// URL 片段解码：`+` 视为空格，再做百分号解码
fn decode_component(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

fn decode_userinfo(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn display_name(url: &Url, node_type: NodeType) -> String {
    url.fragment()
        .map(decode_component)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| node_type.placeholder_name().to_string())
}

/// 提取主机名，IPv6 去掉方括号
fn host_of(url: &Url) -> Result<String, LinkError> {
    match url.host() {
        Some(Host::Domain(d)) if !d.is_empty() => Ok(d.to_string()),
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        _ => Err(LinkError::MissingHost),
    }
}

/// `user[:password]` 整体 (已解码)
fn credential_of(url: &Url) -> String {
    let user = decode_userinfo(url.username());
    match url.password() {
        Some(p) => format!("{}:{}", user, decode_userinfo(p)),
        None => user,
    }
}

/// 查询参数，同名参数以首次出现为准
fn query_map(url: &Url) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (k, v) in url.query_pairs() {
        map.entry(k.into_owned()).or_insert_with(|| v.into_owned());
    }
    map
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.filter(|s| !s.is_empty()).cloned()
}

fn tls_from_query(q: &HashMap<String, String>) -> TlsParams {
    TlsParams {
        sni: non_empty(q.get("sni")).or_else(|| non_empty(q.get("peer"))),
        insecure: matches!(
            q.get("allowInsecure").or_else(|| q.get("insecure")).map(String::as_str),
            Some("1") | Some("true")
        ),
        fingerprint: non_empty(q.get("fp")),
        alpn: q
            .get("alpn")
            .map(|a| {
                a.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

// --- 协议解析 ---

fn parse_vless(raw: &str) -> Result<ProxyLink, LinkError> {
    let url = Url::parse(raw)?;
    let q = query_map(&url);
    let security = q.get("security").map(String::as_str).unwrap_or("");

    let tls = matches!(security, "tls" | "reality" | "xtls").then(|| tls_from_query(&q));
    let reality = (security == "reality").then(|| RealityParams {
        public_key: q.get("pbk").cloned().unwrap_or_default(),
        short_id: q.get("sid").cloned().unwrap_or_default(),
    });

    Ok(ProxyLink {
        name: display_name(&url, NodeType::Vless),
        server: host_of(&url)?,
        port: url.port().unwrap_or(80),
        protocol: Protocol::Vless(VlessParams {
            uuid: credential_of(&url),
            flow: non_empty(q.get("flow")),
            tls,
            reality,
            transport: TransportParams::from_query(&q),
        }),
    })
}

fn json_str(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_u64(v: &Value, key: &str) -> Option<u64> {
    let field = v.get(key)?;
    field.as_u64().or_else(|| field.as_str()?.trim().parse().ok())
}

fn parse_vmess(raw: &str) -> Result<ProxyLink, LinkError> {
    let payload = payload_after(raw, "vmess://")?;
    let decoded = decode_base64_text(payload)
        .ok_or_else(|| LinkError::InvalidPayload("vmess payload is not base64".into()))?;
    let v: Value = serde_json::from_str(decoded.trim())
        .map_err(|e| LinkError::InvalidPayload(format!("vmess json: {}", e)))?;
    if !v.is_object() {
        return Err(LinkError::InvalidPayload("vmess json is not an object".into()));
    }

    let tls = (json_str(&v, "tls").as_deref() == Some("tls")).then(|| TlsParams {
        sni: json_str(&v, "sni").or_else(|| json_str(&v, "host")),
        insecure: false,
        fingerprint: json_str(&v, "fp"),
        alpn: json_str(&v, "alpn")
            .map(|a| a.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
    });

    Ok(ProxyLink {
        name: json_str(&v, "ps").unwrap_or_else(|| NodeType::Vmess.placeholder_name().into()),
        server: json_str(&v, "add").unwrap_or_default(),
        port: json_u64(&v, "port")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(443),
        protocol: Protocol::Vmess(VmessParams {
            uuid: json_str(&v, "id").unwrap_or_default(),
            alter_id: json_u64(&v, "aid")
                .and_then(|a| u32::try_from(a).ok())
                .unwrap_or(0),
            security: json_str(&v, "scy").unwrap_or_else(|| "auto".to_string()),
            tls,
            transport: TransportParams {
                network: json_str(&v, "net").unwrap_or_else(|| "tcp".to_string()),
                path: json_str(&v, "path"),
                host: json_str(&v, "host"),
                service_name: json_str(&v, "path"),
            },
        }),
    })
}

fn parse_trojan(raw: &str) -> Result<ProxyLink, LinkError> {
    let url = Url::parse(raw)?;
    let q = query_map(&url);
    let mut tls = tls_from_query(&q);
    if tls.sni.is_none() {
        tls.sni = non_empty(q.get("host"));
    }

    Ok(ProxyLink {
        name: display_name(&url, NodeType::Trojan),
        server: host_of(&url)?,
        port: url.port().unwrap_or(443),
        protocol: Protocol::Trojan(TrojanParams {
            password: credential_of(&url),
            tls,
            transport: TransportParams::from_query(&q),
        }),
    })
}

fn parse_hysteria2(raw: &str) -> Result<ProxyLink, LinkError> {
    // hy2:// 统一改写为 hysteria2:// 再解析
    let normalized = match strip_scheme(raw, "hy2://") {
        Some(rest) => format!("hysteria2://{}", rest),
        None => raw.to_string(),
    };
    let url = Url::parse(&normalized)?;
    let q = query_map(&url);

    Ok(ProxyLink {
        name: display_name(&url, NodeType::Hysteria2),
        server: host_of(&url)?,
        port: url.port().unwrap_or(443),
        protocol: Protocol::Hysteria2(Hysteria2Params {
            password: credential_of(&url),
            tls: tls_from_query(&q),
            obfs: non_empty(q.get("obfs")),
            obfs_password: q.get("obfs-password").cloned(),
        }),
    })
}

/// `method:password`，先尝试 Base64，再按 SIP002 明文处理
fn split_method_password(userinfo: &str) -> Option<(String, String)> {
    let plain = decode_userinfo(userinfo);
    let text = decode_base64_text(&plain)
        .filter(|d| d.contains(':'))
        .unwrap_or(plain);
    let (method, password) = text.split_once(':')?;
    Some((method.to_string(), password.to_string()))
}

fn parse_shadowsocks(raw: &str) -> Result<ProxyLink, LinkError> {
    let body = payload_after(raw, "ss://")?;
    let (body, fragment) = match body.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (body, None),
    };
    let name = fragment
        .map(decode_component)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| NodeType::Shadowsocks.placeholder_name().to_string());

    // 形式一：ss://base64(method:password)@host:port
    // Base64 字母表含 `/`，userinfo 不能交给 URL 解析器
    if let Some((userinfo, addr)) = body.rsplit_once('@') {
        let url = Url::parse(&format!("ss://{}", addr))?;
        let (method, password) = split_method_password(userinfo)
            .ok_or_else(|| LinkError::InvalidPayload("ss userinfo".into()))?;
        return Ok(ProxyLink {
            name,
            server: host_of(&url)?,
            port: url.port().unwrap_or(443),
            protocol: Protocol::Shadowsocks(ShadowsocksParams { method, password }),
        });
    }

    // 形式二：ss://base64(method:password@host:port)
    let encoded = body
        .split('?')
        .next()
        .unwrap_or(body)
        .trim_end_matches('/');
    let decoded = decode_base64_text(encoded)
        .ok_or_else(|| LinkError::InvalidPayload("ss payload is not base64".into()))?;
    let (auth, addr) = decoded
        .trim()
        .rsplit_once('@')
        .ok_or_else(|| LinkError::InvalidPayload("ss payload lacks '@'".into()))?;
    let (method, password) = auth
        .split_once(':')
        .ok_or_else(|| LinkError::InvalidPayload("ss payload lacks method".into()))?;
    let (host, port) = match addr.rsplit_once(':') {
        Some((h, p)) => (h, p.trim().parse().unwrap_or(443)),
        None => (addr, 443),
    };
    let server = host.trim_start_matches('[').trim_end_matches(']');
    if server.is_empty() {
        return Err(LinkError::MissingHost);
    }

    Ok(ProxyLink {
        name,
        server: server.to_string(),
        port,
        protocol: Protocol::Shadowsocks(ShadowsocksParams {
            method: method.to_string(),
            password: password.to_string(),
        }),
    })
}

/// 拆分 `user:password`，兼容 Base64 编码的 userinfo
fn split_user_password(url: &Url) -> (Option<String>, Option<String>) {
    let user = decode_userinfo(url.username());
    let pass = url.password().map(decode_userinfo);

    let (user, pass) = match pass {
        Some(p) => (user, Some(p)),
        None => match decode_base64_text(&user).and_then(|d| {
            d.split_once(':')
                .map(|(u, p)| (u.to_string(), p.to_string()))
        }) {
            Some((u, p)) => (u, Some(p)),
            None => (user, None),
        },
    };

    if user.is_empty() {
        (None, None)
    } else {
        (Some(user), Some(pass.unwrap_or_default()))
    }
}

fn parse_socks(raw: &str) -> Result<ProxyLink, LinkError> {
    let url = Url::parse(raw)?;
    let version = if url.scheme() == "socks4" { "4" } else { "5" };
    let (username, password) = split_user_password(&url);

    Ok(ProxyLink {
        name: display_name(&url, NodeType::Socks),
        server: host_of(&url)?,
        port: url.port().unwrap_or(1080),
        protocol: Protocol::Socks(SocksParams {
            version: version.to_string(),
            username,
            password,
        }),
    })
}

fn parse_http(raw: &str) -> Result<ProxyLink, LinkError> {
    let url = Url::parse(raw)?;
    let (username, password) = split_user_password(&url);

    Ok(ProxyLink {
        name: display_name(&url, NodeType::Http),
        server: host_of(&url)?,
        port: url.port_or_known_default().unwrap_or(80),
        protocol: Protocol::Http(HttpParams {
            tls: url.scheme() == "https",
            username,
            password,
        }),
    })
}
