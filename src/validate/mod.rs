//! Request validation.
//!
//! [`Validator::validate`] turns a raw [`JobRequest`] into a
//! [`ValidatedRequest`] or fails with a [`ValidationError`]. Checks run in a
//! fixed order: canonicalize the input and confine it to the storage root,
//! probe its size, check filenames and metadata text, resolve and vet the
//! webhook target, then check numeric bounds. Nothing is read from the
//! input and nothing is written anywhere.

pub mod filename;
pub mod params;
pub mod path;
pub mod url;

use std::sync::Arc;

use serde::Deserialize;
use transforge_common::{Result, TransformParams, ValidationError};

use crate::config::Config;
use crate::storage::Storage;

pub use self::url::{ResolvedTarget, WebhookPolicy};

/// A job request as submitted by a caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    /// Storage reference of the input, relative to the storage root.
    pub input: String,

    #[serde(default)]
    pub params: TransformParams,

    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Requested maximum run time; the configured default when absent.
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

/// A request that passed every check.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    /// Canonical storage reference of the input.
    pub input_ref: String,
    pub input_size: u64,
    pub params: TransformParams,
    pub webhook: Option<ResolvedTarget>,
    pub max_duration_secs: u64,
}

/// Limits the validator enforces.
#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub max_input_bytes: u64,
    pub default_max_duration_secs: u64,
    pub max_duration_cap_secs: u64,
    pub webhook: WebhookPolicy,
}

impl ValidatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_input_bytes: config.storage.max_input_bytes,
            default_max_duration_secs: config.workers.default_max_duration_secs,
            max_duration_cap_secs: config.workers.max_duration_cap_secs,
            webhook: webhook_policy(config),
        }
    }
}

/// Webhook policy derived from configuration.
pub fn webhook_policy(config: &Config) -> WebhookPolicy {
    WebhookPolicy {
        allow_http: config.webhook.allow_http,
        trusted_hosts: config.webhook.trusted_hosts.clone(),
    }
}

#[derive(Clone)]
pub struct Validator {
    storage: Arc<dyn Storage>,
    settings: ValidatorSettings,
}

impl Validator {
    pub fn new(storage: Arc<dyn Storage>, settings: ValidatorSettings) -> Self {
        Self { storage, settings }
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    pub async fn validate(&self, request: &JobRequest) -> Result<ValidatedRequest> {
        // 1. canonicalize, then confine
        let input_ref = self.storage.canonicalize(&request.input).await?;

        // 2. size, from metadata only
        let stat = self.storage.stat(&input_ref).await?;
        if !stat.exists {
            return Err(ValidationError::InputNotFound(input_ref).into());
        }
        if !stat.is_file {
            return Err(ValidationError::NotAFile(input_ref).into());
        }
        if stat.size > self.settings.max_input_bytes {
            return Err(ValidationError::InputTooLarge {
                size: stat.size,
                limit: self.settings.max_input_bytes,
            }
            .into());
        }

        // 3. filenames and metadata text
        let file_name = input_ref.rsplit('/').next().unwrap_or(&input_ref);
        filename::validate_filename(file_name)?;
        params::validate_text_fields(&request.params)?;

        // 4. webhook target
        let webhook = match request.webhook_url.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                Some(url::validate_webhook_url(raw, &self.settings.webhook).await?)
            }
            _ => None,
        };

        // 5. numeric bounds
        params::validate_numeric(&request.params)?;
        let max_duration_secs = request
            .max_duration_secs
            .unwrap_or(self.settings.default_max_duration_secs);
        if max_duration_secs == 0 || max_duration_secs > self.settings.max_duration_cap_secs {
            return Err(ValidationError::OutOfRange {
                field: "max_duration_secs",
                value: max_duration_secs,
                min: 1,
                max: self.settings.max_duration_cap_secs,
            }
            .into());
        }

        Ok(ValidatedRequest {
            input_ref,
            input_size: stat.size,
            params: request.params.clone(),
            webhook,
            max_duration_secs,
        })
    }
}
