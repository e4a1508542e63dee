#![allow(missing_docs)]

use chrono::{DateTime, Local};
use serde::Serialize;
use slide_io::{ErrorKind, PipelineError};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Patch,
    Predict,
    Count,
    Merge,
}

impl Display for StageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StageName::Patch => "patch",
            StageName::Predict => "predict",
            StageName::Count => "count",
            StageName::Merge => "merge",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Segmentation succeeded but counting or overlay rendering failed.
    PartialFailure,
    Failed,
}

/// Result of one step for one slide, as reported to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub slide: String,
    pub stage: StageName,
    pub success: bool,
    pub status: StageStatus,
    pub message: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub start_time: DateTime<Local>,
    pub elapsed_secs: f64,
}

impl StageOutcome {
    pub fn completed(
        slide: &str,
        stage: StageName,
        start_time: DateTime<Local>,
        message: String,
    ) -> Self {
        StageOutcome {
            slide: slide.to_string(),
            stage,
            success: true,
            status: StageStatus::Completed,
            message,
            error: None,
            error_kind: None,
            elapsed_secs: elapsed_since(start_time),
            start_time,
        }
    }

    /// `status` is `Failed` or `PartialFailure`.
    pub fn failed(
        slide: &str,
        stage: StageName,
        start_time: DateTime<Local>,
        status: StageStatus,
        err: &anyhow::Error,
    ) -> Self {
        let message = match status {
            StageStatus::PartialFailure => format!("{stage} of {slide} partially failed"),
            StageStatus::Completed | StageStatus::Failed => format!("{stage} of {slide} failed"),
        };
        StageOutcome {
            slide: slide.to_string(),
            stage,
            success: false,
            status,
            message,
            error: Some(format!("{err:#}")),
            error_kind: PipelineError::kind_of(err),
            elapsed_secs: elapsed_since(start_time),
            start_time,
        }
    }

    /// `<m> minutes <s> seconds`
    pub fn elapsed_display(&self) -> String {
        let secs = self.elapsed_secs as u64;
        format!("{} minutes {} seconds", secs / 60, secs % 60)
    }
}

fn elapsed_since(start_time: DateTime<Local>) -> f64 {
    (Local::now() - start_time)
        .to_std()
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_failed_outcome_json() {
        let err = Err::<(), _>(PipelineError::GeometryViolation("tile too large".to_string()))
            .context("While merging")
            .unwrap_err();
        let outcome = StageOutcome::failed(
            "S1_Rein",
            StageName::Merge,
            Local::now(),
            StageStatus::Failed,
            &err,
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "merge");
        assert_eq!(json["error_kind"], "geometry_violation");
        assert_eq!(
            json["error"],
            "While merging: geometry violation: tile too large"
        );
        assert_eq!(json["message"], "merge of S1_Rein failed");
    }

    #[test]
    fn test_completed_outcome() {
        let outcome = StageOutcome::completed(
            "S1_Rein",
            StageName::Patch,
            Local::now(),
            "Total patches: 4".to_string(),
        );
        assert!(outcome.success);
        assert_eq!(outcome.error, None);
        assert!(outcome.elapsed_display().starts_with("0 minutes"));
    }
}
