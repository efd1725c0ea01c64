//! Device credentials issued at registration.
//!
//! A credential bundle ties three things together: the GCM device identity
//! used to log in to the MCS endpoint, the FCM token applications target
//! their pushes at, and the key material the payload decryptor needs. The
//! JSON layout matches what registration services hand out, so bundles can
//! be persisted and reloaded verbatim across runs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PushError, Result};

/// Everything a client needs to log in and decrypt pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Device identity for the MCS login.
    pub gcm: GcmCredentials,
    /// FCM registration output.
    pub fcm: FcmCredentials,
    /// Key material for the payload decryptor.
    pub keys: KeyBundle,
}

/// GCM device identity used for the MCS login.
///
/// The numeric ids are stored as strings to match the persisted JSON layout;
/// [`Credentials::android_id`] and [`Credentials::security_token`] provide
/// the parsed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcmCredentials {
    /// Device id assigned at check-in, decimal.
    pub android_id: String,
    /// Per-device login secret, decimal.
    pub security_token: String,
    /// Application id this device registered under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// GCM-level registration token, when the service issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// FCM registration output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcmCredentials {
    /// Token applications use to address this device.
    pub token: String,
}

/// Base64 encoded key material for payload decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Public half of the device ECDH key.
    pub public: String,
    /// Private half of the device ECDH key.
    pub private: String,
    /// Shared auth secret.
    pub secret: String,
}

impl Credentials {
    /// Android id as the integer the login request needs.
    pub fn android_id(&self) -> Result<u64> {
        self.gcm
            .android_id
            .parse()
            .map_err(|e| PushError::Config(format!("Invalid androidId in credentials: {}", e)))
    }

    /// Security token as the integer the login request needs.
    pub fn security_token(&self) -> Result<u64> {
        self.gcm
            .security_token
            .parse()
            .map_err(|e| PushError::Config(format!("Invalid securityToken in credentials: {}", e)))
    }

    /// Load a credential bundle from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist the bundle as JSON.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
