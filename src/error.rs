//! Typed failure kinds that policy decisions hang off of.
//!
//! Most fallible paths in this crate return [`anyhow::Result`] with context
//! chains; the kinds below are embedded as root causes so callers that need
//! to branch (restore aborts on corruption, the coordinator rebuilds on a
//! missing catalog) can downcast instead of string-matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HoloError {
    /// A decoded byte stream did not hash to the digest the catalog promised.
    #[error("content of {path} hashed to {actual}, catalog says {expected}")]
    Corruption {
        path: String,
        expected: String,
        actual: String,
    },

    /// The stored rewrite prefix and this install's prefix differ in length.
    #[error("rewrite prefix length mismatch: stored {stored}, ours {ours}")]
    ValidationMismatch { stored: usize, ours: usize },

    /// An archive failed structural or safety validation.
    #[error("invalid archive: {0}")]
    ArchiveInvalid(String),

    /// No catalog exists for the requested blueprint.
    #[error("no catalog for blueprint {0}")]
    NotFound(String),

    /// A signal arrived; in-flight work finished, pending work was dropped.
    #[error("cancelled")]
    Cancelled,
}

impl HoloError {
    /// Short remediation tag attached to user-visible failures. An outer
    /// settings provider maps tags to actual documentation URLs; the
    /// library only names the failure class.
    pub fn remediation_tag(&self) -> &'static str {
        match self {
            HoloError::Corruption { .. } => "holotree-corruption",
            HoloError::ValidationMismatch { .. } => "holotree-relocation",
            HoloError::ArchiveInvalid(_) => "holotree-bad-archive",
            HoloError::NotFound(_) => "holotree-missing-catalog",
            HoloError::Cancelled => "holotree-interrupted",
        }
    }
}

/// The remediation tag of the chain's root cause, if it has a typed one.
pub fn remediation_tag(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<HoloError>().map(HoloError::remediation_tag)
}

/// Does any link of this error chain say the library content is corrupt?
pub fn is_corruption(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref(), Some(HoloError::Corruption { .. }))
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref(), Some(HoloError::NotFound(_)))
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kinds_survive_context() {
        let err = anyhow::Error::new(HoloError::NotFound("deadbeef".into()))
            .context("loading catalog")
            .context("restoring space");
        assert!(is_not_found(&err));
        assert!(!is_corruption(&err));
        assert_eq!(remediation_tag(&err), Some("holotree-missing-catalog"));
    }

    #[test]
    fn untyped_errors_have_no_tag() {
        let err = anyhow::anyhow!("plain io trouble");
        assert_eq!(remediation_tag(&err), None);
    }
}
