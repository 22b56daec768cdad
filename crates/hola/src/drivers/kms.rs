//! The `aws_kms` driver: seal or open a payload through the key
//! service and converge the artifact like a file.

use std::fs;

use anyhow::Context;

use hola_kms::{Credentials, KmsError, KmsRequest};

use crate::drivers::DriverContext;
use crate::fsutil;
use crate::source;
use crate::types::{ApplyResult, AwsKmsSpec, DriverError, KmsAction};

pub fn apply(
    spec: &AwsKmsSpec,
    action: KmsAction,
    ctx: &DriverContext,
) -> Result<ApplyResult, DriverError> {
    let request = KmsRequest {
        key_id: spec.key_id.clone(),
        algorithm: spec.algorithm.clone(),
        credentials: Credentials::resolve(
            spec.access_key_id.as_deref(),
            spec.secret_access_key.as_deref(),
            spec.session_token.as_deref(),
            spec.region.as_deref(),
        ),
    };

    let input = spec.source.read(spec.source_encoding).map_err(DriverError::Other)?;

    let artifact = match action {
        KmsAction::Decrypt => {
            let plaintext = ctx.kms.decrypt(&request, &input).map_err(map_kms_err)?;
            source::encode(&plaintext, spec.target_encoding)
        }
        KmsAction::Encrypt => {
            // Ciphertext is nonce-fresh every call, so idempotence is
            // judged by opening the existing artifact, not comparing it.
            if let Some(existing) = read_existing(spec)? {
                if let Ok(opened) = ctx.kms.decrypt(&request, &existing) {
                    if opened == input {
                        return converge_metadata(spec, action);
                    }
                }
            }
            let ciphertext = ctx.kms.encrypt(&request, &input).map_err(map_kms_err)?;
            source::encode(&ciphertext, spec.target_encoding)
        }
    };

    if action == KmsAction::Decrypt {
        if let Ok(current) = fs::read(&spec.path) {
            if current == artifact {
                return converge_metadata(spec, action);
            }
        }
    }

    let mode = fsutil::parse_mode(&spec.mode)?;
    fsutil::atomic_write(&spec.path, &artifact, mode, 0)?;
    fsutil::apply_ownership(&spec.path, spec.owner.as_deref(), spec.group.as_deref())?;
    tracing::debug!(artifact = %spec.path.display(), action = %action, "secret converged");
    Ok(ApplyResult::updated(action.as_str()))
}

/// Existing artifact decoded back to raw ciphertext, if present and
/// decodable.
fn read_existing(spec: &AwsKmsSpec) -> Result<Option<Vec<u8>>, DriverError> {
    match fs::read(&spec.path) {
        Ok(raw) => Ok(source::decode(&raw, spec.target_encoding).ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DriverError::Other(anyhow::Error::new(err).context(format!(
            "failed to read {}",
            spec.path.display()
        )))),
    }
}

fn converge_metadata(spec: &AwsKmsSpec, action: KmsAction) -> Result<ApplyResult, DriverError> {
    let mode = fsutil::parse_mode(&spec.mode)?;
    let mut changed = fsutil::apply_mode(&spec.path, mode)?;
    changed |= fsutil::apply_ownership(&spec.path, spec.owner.as_deref(), spec.group.as_deref())?;
    if changed {
        Ok(ApplyResult::updated(action.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(action.as_str()))
    }
}

fn map_kms_err(err: KmsError) -> DriverError {
    match err {
        KmsError::Denied(message) => DriverError::KmsDenied(message),
        other => DriverError::Other(anyhow::Error::new(other)),
    }
}
