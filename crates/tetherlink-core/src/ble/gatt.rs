use crate::ble::{CredentialFrame, PeerCommand, TelemetryReport};
use crate::crypto::{CipherError, CredentialCipher};
use crate::hotspot::HotspotCredentials;
use crate::telemetry::TelemetrySample;

/// Handles GATT characteristic payload encoding/decoding
pub struct GattCodec;

impl GattCodec {
    /// Encrypt hotspot credentials for CREDENTIALS write
    pub fn encode_credentials(
        creds: &HotspotCredentials,
        cipher: &CredentialCipher,
    ) -> Result<Vec<u8>, CipherError> {
        let payload = cipher.encrypt(&creds.to_plaintext())?;
        let frame = CredentialFrame {
            ciphertext: payload.ciphertext,
            iv: payload.iv,
        };
        // 两个 String 字段的序列化不会失败
        Ok(serde_json::to_vec(&frame).unwrap_or_default())
    }

    /// Decrypt a CREDENTIALS frame (desktop side of the exchange)
    pub fn decode_credentials(
        data: &[u8],
        cipher: &CredentialCipher,
    ) -> anyhow::Result<HotspotCredentials> {
        let frame: CredentialFrame = serde_json::from_slice(data)?;
        let plaintext = cipher.decrypt(&frame.ciphertext, &frame.iv)?;
        let creds: HotspotCredentials = serde_json::from_str(&plaintext)?;
        Ok(creds)
    }

    /// Encode a telemetry sample for TELEMETRY write
    pub fn encode_telemetry(sample: &TelemetrySample) -> Vec<u8> {
        let report = TelemetryReport {
            signal_level: sample.signal_level,
            network_type: sample.network_type.clone(),
            battery_percent: sample.battery_percent,
        };
        serde_json::to_vec(&report).unwrap_or_default()
    }

    /// Parse a command notified on COMMAND
    pub fn parse_command(data: &[u8]) -> anyhow::Result<PeerCommand> {
        let json_str = std::str::from_utf8(data)?;
        let cmd: PeerCommand = serde_json::from_str(json_str)?;
        Ok(cmd)
    }
}
