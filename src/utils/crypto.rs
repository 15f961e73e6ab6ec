//! 订阅负载解密 (Subscription Payload Decryption)
//!
//! 负载格式：`base64(12 字节 nonce || 密文 || 16 字节 tag)`，算法 AES-128-GCM。
//! 密钥取自 [`KeySource`]，UTF-8 字节截断或零填充至 16 字节。

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::core::error::{PilotError, Result};
use crate::utils::decode_base64_auto;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 16;

/// 密钥来源
pub trait KeySource: Send + Sync {
    fn key(&self) -> Option<String>;
}

/// 来自配置文件的静态密钥
#[derive(Debug, Clone, Default)]
pub struct StaticKey(pub Option<String>);

impl KeySource for StaticKey {
    fn key(&self) -> Option<String> {
        self.0.clone()
    }
}

fn derive_key(key: &str) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    let bytes = key.as_bytes();
    let n = bytes.len().min(KEY_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// 解密订阅负载
pub fn decrypt_payload(encoded: &str, key: &str) -> Result<String> {
    let combined = decode_base64_auto(encoded)
        .ok_or_else(|| PilotError::Crypto("payload is not base64".into()))?;
    if combined.len() < NONCE_LEN + TAG_LEN {
        return Err(PilotError::Crypto(format!(
            "payload too short: {} bytes",
            combined.len()
        )));
    }

    let cipher = Aes128Gcm::new_from_slice(&derive_key(key))
        .map_err(|e| PilotError::Crypto(e.to_string()))?;
    let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| PilotError::Crypto("authentication failed".into()))?;

    String::from_utf8(plain).map_err(|e| PilotError::Crypto(e.to_string()))
}

/// 加密为订阅负载格式，供发布端与测试使用
pub fn encrypt_payload(plain: &str, key: &str, nonce: [u8; NONCE_LEN]) -> Result<String> {
    let cipher = Aes128Gcm::new_from_slice(&derive_key(key))
        .map_err(|e| PilotError::Crypto(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
        .map_err(|e| PilotError::Crypto(e.to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(combined))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypts_own_output() {
        let body = encrypt_payload("trojan://pw@h:443#x", "secret", [7u8; 12]).unwrap();
        assert_eq!(decrypt_payload(&body, "secret").unwrap(), "trojan://pw@h:443#x");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let body = encrypt_payload("hello", "secret", [1u8; 12]).unwrap();
        assert!(matches!(
            decrypt_payload(&body, "other"),
            Err(PilotError::Crypto(_))
        ));
    }

    #[test]
    fn long_keys_are_truncated() {
        let body = encrypt_payload("data", "0123456789abcdefXYZ", [2u8; 12]).unwrap();
        assert_eq!(decrypt_payload(&body, "0123456789abcdef").unwrap(), "data");
    }

    #[test]
    fn short_input_rejected() {
        assert!(decrypt_payload("AAAA", "k").is_err());
    }
}
