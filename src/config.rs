use crate::protocol::AdbError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where adbd lives and how long to wait for it.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    pub host: String,
    pub port: u16,
    /// TCP dial timeout
    pub connect_timeout_ms: u64,
    /// Deadline for the CNXN/AUTH handshake. `None` waits for as long as the
    /// user takes to accept the authorization prompt.
    pub handshake_timeout_ms: Option<u64>,
    /// Deadline for the peer to answer an OPEN
    pub open_timeout_ms: Option<u64>,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    /// Shown next to the key in the device's authorization prompt
    pub key_label: String,
    /// CNXN payload, without the trailing NUL
    pub system_identity: String,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: None,
            open_timeout_ms: None,
            private_key_path: PathBuf::from("adb_key"),
            public_key_path: PathBuf::from("adb_key.pub"),
            key_label: "appfreeze@tv".to_string(),
            system_identity: "host::".to_string(),
        }
    }
}

impl AdbConfig {
    /// Load from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, AdbError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| AdbError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> Result<Self, AdbError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| AdbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AdbError> {
        if self.host.is_empty() {
            return Err(AdbError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(AdbError::Config("port must not be 0".to_string()));
        }
        if self.key_label.contains('\0') || self.system_identity.contains('\0') {
            return Err(AdbError::Config(
                "key_label and system_identity must not contain NUL".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn open_timeout(&self) -> Option<Duration> {
        self.open_timeout_ms.map(Duration::from_millis)
    }

    /// CNXN payload: identity banner plus NUL
    pub fn connect_payload(&self) -> Vec<u8> {
        let mut payload = self.system_identity.as_bytes().to_vec();
        payload.push(0);
        payload
    }
}
