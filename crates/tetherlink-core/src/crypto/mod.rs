//! 加密模块
//!
//! 由二维码中共享 PIN 派生对称密钥，保护发往桌面端的热点凭据。

pub mod credential_cipher;

pub use credential_cipher::{CipherError, CredentialCipher, EncryptedPayload};
