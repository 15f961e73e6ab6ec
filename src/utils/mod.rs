use std::path::Path;

use base64::{Engine as _, engine::general_purpose};
use md5::{Digest, Md5};
use tokio::fs;

pub mod crypto;
pub mod link;
pub mod singbox;
pub mod subscription;

/// 执行启发式 Base64 解码 (Heuristic Decoding)
///
/// 忽略空白字符，依次尝试标准、无填充与 URL 安全字母表。
pub fn decode_base64_auto(input: &str) -> Option<Vec<u8>> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.is_empty() {
        return None;
    }
    let engines = [
        &general_purpose::STANDARD,
        &general_purpose::STANDARD_NO_PAD,
        &general_purpose::URL_SAFE,
        &general_purpose::URL_SAFE_NO_PAD,
    ];

    engines.into_iter().find_map(|engine| engine.decode(&clean).ok())
}

/// Base64 解码为 UTF-8 文本，非法字节按有损方式替换
pub fn decode_base64_text(input: &str) -> Option<String> {
    decode_base64_auto(input).map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// 小写十六进制 MD5，节点 id 的唯一来源
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// 当前 Unix 毫秒时间戳
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub async fn save_file(path: impl AsRef<Path>, data: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_variants() {
        assert_eq!(decode_base64_text("aGVsbG8=").as_deref(), Some("hello"));
        assert_eq!(decode_base64_text("aGVsbG8").as_deref(), Some("hello"));
        assert_eq!(decode_base64_text("aGVs\nbG8=").as_deref(), Some("hello"));
        assert_eq!(decode_base64_text("Pz8_").as_deref(), Some("???"));
        assert!(decode_base64_text("vless://not-base64").is_none());
        assert!(decode_base64_text("   ").is_none());
    }

    #[test]
    fn md5_is_lower_hex() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
