use serde::{Deserialize, Serialize};

/// SSID 最大长度（字符）
pub const MAX_SSID_LEN: usize = 32;
/// 密码最大长度（字符）
pub const MAX_PASSWORD_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("SSID must not be empty")]
    EmptySsid,

    #[error("SSID is longer than {MAX_SSID_LEN} characters")]
    SsidTooLong,

    #[error("SSID must not contain '\"'")]
    SsidContainsQuote,

    #[error("Password is longer than {MAX_PASSWORD_LEN} characters")]
    PasswordTooLong,
}

/// 用户填写的热点凭据，也是加密前的明文 JSON 格式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotspotCredentials {
    pub ssid: String,
    pub password: String,
}

impl HotspotCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, CredentialsError> {
        let creds = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        creds.validate()?;
        Ok(creds)
    }

    pub fn validate(&self) -> Result<(), CredentialsError> {
        if self.ssid.is_empty() {
            return Err(CredentialsError::EmptySsid);
        }
        if self.ssid.chars().count() > MAX_SSID_LEN {
            return Err(CredentialsError::SsidTooLong);
        }
        if self.ssid.contains('"') {
            return Err(CredentialsError::SsidContainsQuote);
        }
        if self.password.chars().count() > MAX_PASSWORD_LEN {
            return Err(CredentialsError::PasswordTooLong);
        }
        Ok(())
    }

    /// 加密前的明文
    pub fn to_plaintext(&self) -> String {
        // 两个 String 字段的序列化不会失败
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_credentials() {
        let creds = HotspotCredentials::new("Home", "longpassword1").unwrap();
        assert_eq!(creds.to_plaintext(), r#"{"ssid":"Home","password":"longpassword1"}"#);
    }

    #[test]
    fn test_ssid_limits() {
        assert_eq!(
            HotspotCredentials::new("", "pw").unwrap_err(),
            CredentialsError::EmptySsid
        );
        assert!(HotspotCredentials::new("a".repeat(32), "pw").is_ok());
        assert_eq!(
            HotspotCredentials::new("a".repeat(33), "pw").unwrap_err(),
            CredentialsError::SsidTooLong
        );
        assert_eq!(
            HotspotCredentials::new("my\"net", "pw").unwrap_err(),
            CredentialsError::SsidContainsQuote
        );
    }

    #[test]
    fn test_password_limit() {
        assert!(HotspotCredentials::new("Home", "p".repeat(63)).is_ok());
        assert_eq!(
            HotspotCredentials::new("Home", "p".repeat(64)).unwrap_err(),
            CredentialsError::PasswordTooLong
        );
    }

    #[test]
    fn test_limits_count_characters() {
        // 32 个多字节字符仍然合法
        assert!(HotspotCredentials::new("热".repeat(32), "pw").is_ok());
    }
}
