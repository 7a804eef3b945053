// src/license.rs

use crate::capability::{BackendError, LicenseProvider};
use crate::config::LicenseSettings;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license runtime error: {0}")]
    Runtime(#[from] BackendError),
    #[error("no service token at {0}")]
    TokenMissing(PathBuf),
    #[error("license acquisition timed out after {0:?}")]
    Timeout(Duration),
}

/// Initializes the DRM runtime, personalizes it when needed and feeds it the
/// service token. Must complete before any download is resumed or started.
/// Returns how long the whole sequence took.
pub async fn acquire_license(
    provider: &dyn LicenseProvider,
    settings: &LicenseSettings,
) -> Result<Duration, LicenseError> {
    let start = Instant::now();
    let timeout = settings.timeout();

    tokio::time::timeout(timeout, run(provider, settings))
        .await
        .map_err(|_| LicenseError::Timeout(timeout))??;

    let elapsed = start.elapsed();
    tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "License successfully acquired");
    Ok(elapsed)
}

async fn run(provider: &dyn LicenseProvider, settings: &LicenseSettings) -> Result<(), LicenseError> {
    provider.initialize(&settings.data_dir).await?;
    if !provider.is_personalized().await? {
        tracing::info!("Personalizing license runtime");
        provider.personalize().await?;
    }

    let token = match tokio::fs::read_to_string(&settings.token_path).await {
        Ok(token) if !token.trim().is_empty() => token,
        Ok(_) => return Err(LicenseError::TokenMissing(settings.token_path.clone())),
        Err(e) => {
            tracing::error!(path = %settings.token_path.display(), error = %e, "Could not read service token");
            return Err(LicenseError::TokenMissing(settings.token_path.clone()));
        }
    };
    provider.process_service_token(&token).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MockLicenseProvider;

    fn settings(dir: &std::path::Path, timeout_secs: u64) -> LicenseSettings {
        LicenseSettings {
            data_dir: dir.join("license"),
            token_path: dir.join("token.xml"),
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn personalizes_once_then_processes_token() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("token.xml"), "<token/>").await.unwrap();

        let mut provider = MockLicenseProvider::new();
        provider.expect_initialize().times(1).returning(|_| Ok(()));
        provider.expect_is_personalized().times(1).returning(|| Ok(false));
        provider.expect_personalize().times(1).returning(|| Ok(()));
        provider
            .expect_process_service_token()
            .withf(|token: &str| token == "<token/>")
            .times(1)
            .returning(|_| Ok(()));

        acquire_license(&provider, &settings(dir.path(), 5)).await.unwrap();
    }

    #[tokio::test]
    async fn skips_personalization_when_done() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("token.xml"), "<token/>").await.unwrap();

        let mut provider = MockLicenseProvider::new();
        provider.expect_initialize().returning(|_| Ok(()));
        provider.expect_is_personalized().returning(|| Ok(true));
        provider.expect_personalize().times(0);
        provider.expect_process_service_token().times(1).returning(|_| Ok(()));

        acquire_license(&provider, &settings(dir.path(), 5)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_token_is_reported() {
        let dir = tempfile::tempdir().unwrap();

        let mut provider = MockLicenseProvider::new();
        provider.expect_initialize().returning(|_| Ok(()));
        provider.expect_is_personalized().returning(|| Ok(true));
        provider.expect_process_service_token().times(0);

        let err = acquire_license(&provider, &settings(dir.path(), 5)).await.unwrap_err();
        assert!(matches!(err, LicenseError::TokenMissing(_)));
    }

    struct HangingRuntime;

    #[async_trait::async_trait]
    impl LicenseProvider for HangingRuntime {
        async fn initialize(&self, _data_dir: &std::path::Path) -> Result<(), BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn is_personalized(&self) -> Result<bool, BackendError> {
            Ok(true)
        }
        async fn personalize(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn process_service_token(&self, _token: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn gives_up_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = acquire_license(&HangingRuntime, &settings(dir.path(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LicenseError::Timeout(d) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn runtime_rejection_propagates() {
        let dir = tempfile::tempdir().unwrap();

        let mut provider = MockLicenseProvider::new();
        provider.expect_initialize().returning(|_| {
            Err(BackendError::Rejected {
                operation: "initialize",
                reason: "no storage".into(),
            })
        });

        let err = acquire_license(&provider, &settings(dir.path(), 5)).await.unwrap_err();
        assert!(matches!(err, LicenseError::Runtime(_)));
    }
}
