#![allow(missing_docs)]

use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Failure classes a slide-level run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedInput,
    MissingArtifact,
    GeometryViolation,
    Resource,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::UnsupportedInput => "unsupported-input",
            ErrorKind::MissingArtifact => "missing-artifact",
            ErrorKind::GeometryViolation => "geometry-violation",
            ErrorKind::Resource => "resource",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(
        "unsupported slide {path:?}: expected one of the extensions svs, tif, tiff or bif"
    )]
    UnsupportedExtension { path: PathBuf },

    #[error("unsupported pixel layout in {path:?}: {detail}")]
    UnsupportedPixels { path: PathBuf, detail: String },

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("geometry violation: {0}")]
    GeometryViolation(String),

    /// Writing the intermediate composite failed. The temp file is kept.
    #[error("resource failure while writing {path:?}")]
    Resource { path: PathBuf },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedExtension { .. } | Self::UnsupportedPixels { .. } => {
                ErrorKind::UnsupportedInput
            }
            Self::MissingArtifact(_) => ErrorKind::MissingArtifact,
            Self::GeometryViolation(_) => ErrorKind::GeometryViolation,
            Self::Resource { .. } => ErrorKind::Resource,
        }
    }

    /// Find the pipeline error kind anywhere in an error's context chain.
    pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
        err.downcast_ref::<PipelineError>().map(PipelineError::kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    fn fails_with_context() -> Result<()> {
        Err(PipelineError::MissingArtifact("tile_0_0.json".to_string()))
            .context("while counting nuclei")
    }

    #[test]
    fn test_kind_survives_context() {
        let err = fails_with_context().unwrap_err();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::MissingArtifact));
    }

    #[test]
    fn test_kind_as_context() {
        let err = std::fs::read("/definitely/not/here")
            .context(PipelineError::Resource {
                path: PathBuf::from("/definitely/not/here"),
            })
            .unwrap_err();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::Resource));
        assert_eq!(ErrorKind::Resource.to_string(), "resource");
    }

    #[test]
    fn test_plain_errors_have_no_kind() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(PipelineError::kind_of(&err), None);
    }
}
