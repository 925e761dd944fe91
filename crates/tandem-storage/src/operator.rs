//! OpenDAL Operator factory for the attachment store

use anyhow::{Context, Result};
use opendal::Operator;
use tandem_core::config::AttachmentConfig;

/// Build the operator named by `[attachments]`: a filesystem root when one is
/// configured, otherwise an in-memory backend (useful for ephemeral replicas).
pub fn build_operator(cfg: &AttachmentConfig) -> Result<Operator> {
    match &cfg.root {
        Some(root) => fs_operator(&root.to_string_lossy()),
        None => {
            tracing::warn!("no attachments.root configured; attachment payloads are kept in memory");
            memory_operator()
        }
    }
}

pub fn fs_operator(root: &str) -> Result<Operator> {
    let builder = opendal::services::Fs::default().root(root);
    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

pub fn memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_memory_by_default() {
        let cfg = AttachmentConfig::default();
        assert!(build_operator(&cfg).is_ok());
    }

    #[test]
    fn test_build_fs_operator() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AttachmentConfig {
            root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }
}
