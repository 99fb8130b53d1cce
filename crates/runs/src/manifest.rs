//! Checksummed, optionally HMAC-signed run manifests.

use {
    chrono::{DateTime, SecondsFormat, Utc},
    hmac::{Hmac, Mac},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

use crate::{
    budget::RunUsage,
    error::{Context, Result},
    types::RunStatus,
};

type HmacSha256 = Hmac<Sha256>;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_ARTIFACT_NAME: &str = "run-manifest.json";
pub const SIGNATURE_ALGO: &str = "hmac-sha256";

#[derive(Debug, Clone)]
pub struct ManifestInput {
    pub run_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub status: RunStatus,
    pub intent_type: Option<String>,
    pub model_used: String,
    pub usage: RunUsage,
    pub sandbox_provider: Option<String>,
    pub error_message: Option<String>,
}

/// Canonical manifest body. Field order defines the signed serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub schema_version: u32,
    pub generated_at: String,
    pub run_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub status: RunStatus,
    pub intent_type: Option<String>,
    pub model_used: String,
    pub usage: RunUsage,
    pub sandbox_provider: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifest {
    pub manifest: RunManifest,
    pub checksum_sha256: String,
    pub signature: Option<String>,
    pub signature_algo: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl RunManifest {
    #[must_use]
    pub fn new(input: ManifestInput, generated_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            run_id: input.run_id,
            user_id: input.user_id,
            conversation_id: input.conversation_id,
            status: input.status,
            intent_type: non_empty(input.intent_type),
            model_used: input.model_used,
            usage: input.usage,
            sandbox_provider: non_empty(input.sandbox_provider),
            error_message: non_empty(input.error_message),
        }
    }

    /// Compact JSON in declaration order.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checksum and, when a non-empty key is given, sign the canonical form.
    pub fn sign(self, signing_key: Option<&Secret<String>>) -> Result<SignedManifest> {
        let serialized = self.canonical_json()?;
        let checksum_sha256 = hex::encode(Sha256::digest(serialized.as_bytes()));

        let key = signing_key
            .map(|k| k.expose_secret().as_str())
            .filter(|k| !k.is_empty());
        let Some(key) = key else {
            return Ok(SignedManifest {
                manifest: self,
                checksum_sha256,
                signature: None,
                signature_algo: None,
            });
        };

        let mut mac =
            HmacSha256::new_from_slice(key.as_bytes()).context("invalid manifest signing key")?;
        mac.update(serialized.as_bytes());
        Ok(SignedManifest {
            manifest: self,
            checksum_sha256,
            signature: Some(hex::encode(mac.finalize().into_bytes())),
            signature_algo: Some(SIGNATURE_ALGO.to_string()),
        })
    }
}

/// Build and sign a manifest stamped with the current time.
pub fn build_signed_manifest(
    input: ManifestInput,
    signing_key: Option<&Secret<String>>,
) -> Result<SignedManifest> {
    RunManifest::new(input, Utc::now()).sign(signing_key)
}
