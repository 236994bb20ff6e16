//! 凭据加密
//!
//! 与桌面端共享的对称加密逻辑：
//! - 密钥 = SHA-256(共享 PIN 的 UTF-8 字节)，32 字节
//! - AES-256-CBC + PKCS#7 填充
//! - 每次加密生成新的 16 字节随机 IV，与密文一起以 Base64 发送

use std::sync::RwLock;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine as _, engine::general_purpose};
use log::debug;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("Cipher used before a key was derived")]
    NotInitialized,

    #[error("Decryption failed: {0}")]
    DecryptFailed(String),
}

/// 加密结果：Base64 密文 + Base64 IV
///
/// 同时也是写入凭据特征的 JSON 帧格式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
}

/// 由共享密钥派生的对称加密器
///
/// 密钥只在 [`initialize`](Self::initialize) 时派生，之后不会被重新计算；
/// 未初始化时任何加密/解密调用都会返回 [`CipherError::NotInitialized`]。
#[derive(Default)]
pub struct CredentialCipher {
    key: RwLock<Option<[u8; 32]>>,
}

impl CredentialCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从共享密钥派生并保存 AES 密钥
    pub fn initialize(&self, secret: &str) {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);

        *self.key.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(key);
        debug!("Credential cipher initialized");
    }

    /// 清除密钥（解除配对时调用）
    pub fn clear(&self) {
        *self.key.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.key
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    fn current_key(&self) -> Result<[u8; 32], CipherError> {
        self.key
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .ok_or(CipherError::NotInitialized)
    }

    /// 使用 AES-256-CBC 加密，返回 Base64 密文和 IV
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedPayload, CipherError> {
        let key = self.current_key()?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(EncryptedPayload {
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
            iv: general_purpose::STANDARD.encode(iv),
        })
    }

    /// [`encrypt`](Self::encrypt) 的逆操作
    pub fn decrypt(&self, ciphertext_b64: &str, iv_b64: &str) -> Result<String, CipherError> {
        let key = self.current_key()?;

        let ciphertext = general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| CipherError::DecryptFailed(format!("ciphertext: {e}")))?;
        let iv_bytes = general_purpose::STANDARD
            .decode(iv_b64)
            .map_err(|e| CipherError::DecryptFailed(format!("iv: {e}")))?;
        let iv: [u8; IV_LEN] = iv_bytes
            .try_into()
            .map_err(|_| CipherError::DecryptFailed("IV must be 16 bytes".to_string()))?;

        let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CipherError::DecryptFailed("bad padding".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CipherError::DecryptFailed(e.to_string()))
    }

    pub fn decrypt_payload(&self, payload: &EncryptedPayload) -> Result<String, CipherError> {
        self.decrypt(&payload.ciphertext, &payload.iv)
    }
}
