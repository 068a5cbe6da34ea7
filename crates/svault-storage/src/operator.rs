//! OpenDAL Operator factory for slicevault blob backends

use anyhow::{Context, Result};
use opendal::Operator;
use std::path::Path;

use svault_core::config::{expand_tilde, StorageConfig};

/// S3 credentials, read from the standard AWS environment variables
#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Credentials {
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID is not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY is not set")?;
        Ok(Self {
            access_key_id,
            secret_access_key,
        })
    }
}

/// Build the operator selected by `storage.backend`.
///
/// `fs` roots at `storage.root`, `memory` is process-local (useful for dry
/// runs), `s3` reads credentials from the environment.
pub fn build_operator(storage: &StorageConfig) -> Result<Operator> {
    match storage.backend.as_str() {
        "memory" => Ok(with_layers(
            Operator::new(opendal::services::Memory::default())
                .context("creating OpenDAL memory operator")?
                .finish(),
        )),
        "fs" => build_fs_operator(&expand_tilde(&storage.root)),
        "s3" => build_s3_operator(storage, &S3Credentials::from_env()?),
        other => anyhow::bail!("unknown storage backend '{other}'"),
    }
}

fn build_fs_operator(root: &Path) -> Result<Operator> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("creating storage root: {}", root.display()))?;
    let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
    Ok(with_layers(
        Operator::new(builder)
            .context("creating OpenDAL fs operator")?
            .finish(),
    ))
}

/// Build an operator for an S3-compatible endpoint.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_s3_operator(storage: &StorageConfig, creds: &S3Credentials) -> Result<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; chunks are encrypted but credentials are not"
        );
    }

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(&creds.secret_access_key);

    Ok(with_layers(
        Operator::new(builder)
            .context("creating OpenDAL S3 operator")?
            .finish(),
    ))
}

fn with_layers(op: Operator) -> Operator {
    op.layer(opendal::layers::LoggingLayer::default()).layer(
        opendal::layers::RetryLayer::new()
            .with_max_times(5)
            .with_jitter(),
    )
}
