//! Connection settings loaded from a `.env` file (via `dotenvy`) and the process
//! environment (via the `config` crate). The library itself never depends on
//! either crate; this module is strictly host-application glue.

use std::time::Duration;

use anyhow::{Context, Result};
use modbus_ble_core::KeyBundle;
use serde::Deserialize;

/// Settings for a single scan run. Every field has a default so the CLI runs with
/// no `.env` file at all; key material is the only thing that must be supplied to
/// exercise the encrypted path.
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub device_name_filter: Option<String>,

    #[serde(default = "default_scan_seconds")]
    pub adapter_scan_seconds: u64,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default)]
    pub scan_start: u16,

    #[serde(default = "default_scan_end")]
    pub scan_end: u16,

    #[serde(default)]
    pub signing_key_hex: Option<String>,
    #[serde(default)]
    pub verify_key_hex: Option<String>,
    #[serde(default)]
    pub shared_secret_hex: Option<String>,
}

fn default_scan_seconds() -> u64 {
    5
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_scan_end() -> u16 {
    8000
}

impl Settings {
    /// Loads `.env` (if present) and then `MODBUS_BLE_*`-prefixed environment
    /// variables over the defaults above.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("MODBUS_BLE")
                    .try_parsing(true)
                    .separator("_"),
            )
            .build()
            .context("failed to assemble configuration sources")?;

        settings
            .try_deserialize()
            .context("failed to parse configuration into Settings")
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Builds a `KeyBundle` from the three hex fields if all three are present.
    /// Returns `Ok(None)` (not an error) when key material is simply absent, since
    /// an unencrypted device is a valid thing to scan.
    pub fn key_bundle(&self) -> Result<Option<KeyBundle>> {
        match (
            &self.signing_key_hex,
            &self.verify_key_hex,
            &self.shared_secret_hex,
        ) {
            (None, None, None) => Ok(None),
            (Some(signing), Some(verify), Some(shared)) => {
                let bundle = KeyBundle::from_hex(signing, verify, shared)
                    .context("configured key bundle is invalid")?;
                Ok(Some(bundle))
            }
            _ => anyhow::bail!(
                "signing_key_hex, verify_key_hex and shared_secret_hex must all be set together"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bundle_is_none_when_all_fields_absent() {
        let settings = Settings {
            device_name_filter: None,
            adapter_scan_seconds: default_scan_seconds(),
            response_timeout_ms: default_response_timeout_ms(),
            scan_start: 0,
            scan_end: default_scan_end(),
            signing_key_hex: None,
            verify_key_hex: None,
            shared_secret_hex: None,
        };
        assert!(settings.key_bundle().unwrap().is_none());
    }

    #[test]
    fn key_bundle_rejects_partial_configuration() {
        let settings = Settings {
            device_name_filter: None,
            adapter_scan_seconds: default_scan_seconds(),
            response_timeout_ms: default_response_timeout_ms(),
            scan_start: 0,
            scan_end: default_scan_end(),
            signing_key_hex: Some("aabb".into()),
            verify_key_hex: None,
            shared_secret_hex: None,
        };
        assert!(settings.key_bundle().is_err());
    }
}
