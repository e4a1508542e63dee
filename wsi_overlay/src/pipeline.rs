//!
//! Runs the stages for one slide or a batch of slides.
//!
//! Every step opens its run log, records its start time, runs the stage and
//! turns the result into a [`StageOutcome`]. A failing step is logged and
//! reported; it never stops the other slides of a batch.
//!
#![allow(missing_docs)]

use crate::layout::{LogName, SlideLayout};
use crate::nucleus::NucleusSegmentor;
use crate::outcome::{StageName, StageOutcome, StageStatus};
use crate::run_log::RunLog;
use crate::stages::count_nuclei::CountNuclei;
use crate::stages::extract_patches::ExtractPatches;
use crate::stages::merge_tiles::MergeTiles;
use crate::stages::predict_nuclei::{has_tissue, PredictNuclei};
use crate::stages::SlideStage;
use anyhow::Result;
use chrono::{DateTime, Local};
use log::error;
use std::path::{Path, PathBuf};
use wsi_parameters::Parameters;

fn run_logged<S: SlideStage>(
    stage: &S,
    layout: &SlideLayout,
    log: &RunLog,
) -> (DateTime<Local>, Result<S::StageOutputs>) {
    let start_time = Local::now();
    log.info(&format!(
        "Starting {} of {} at {}",
        stage.name(),
        layout.id_name(),
        start_time.to_rfc2822()
    ));
    (start_time, stage.run(layout, log))
}

fn record(log: &RunLog, outcome: &StageOutcome) {
    let line = format!(
        "File ID: {}, Start Time: {}, {}, Elapsed time: {}",
        outcome.slide,
        outcome.start_time.to_rfc2822(),
        outcome.message,
        outcome.elapsed_display()
    );
    match &outcome.error {
        None => log.info(&line),
        Some(err) => log.error(&format!("{line}, Error: {err}")),
    }
    match serde_json::to_string(outcome) {
        Ok(json) => log.info(&json),
        Err(err) => error!("Unable to serialize outcome: {err}"),
    }
}

fn finish<S: SlideStage>(
    stage: &S,
    layout: &SlideLayout,
    log: &RunLog,
    (start_time, result): (DateTime<Local>, Result<S::StageOutputs>),
    failure: StageStatus,
) -> StageOutcome {
    let outcome = match result {
        Ok(outputs) => {
            StageOutcome::completed(layout.id_name(), stage.name(), start_time, outputs.to_string())
        }
        Err(err) => StageOutcome::failed(layout.id_name(), stage.name(), start_time, failure, &err),
    };
    record(log, &outcome);
    outcome
}

/// Outcome for a step that could not even open its run log.
fn unlogged_failure(slide: &str, stage: StageName, err: &anyhow::Error) -> StageOutcome {
    error!("{stage} of {slide} failed before its run log was opened: {err:#}");
    StageOutcome::failed(slide, stage, Local::now(), StageStatus::Failed, err)
}

/// Runs the steps of the pipeline against the slide directories under
/// `uploads`.
pub struct Pipeline {
    uploads: PathBuf,
    params: Parameters,
}

impl Pipeline {
    pub fn new(uploads: &Path, params: Parameters) -> Self {
        Pipeline {
            uploads: uploads.to_path_buf(),
            params,
        }
    }

    pub fn layout(&self, slide: &Path) -> Result<SlideLayout> {
        SlideLayout::new(&self.uploads, slide, self.params.norm_method)
    }

    fn slide_name(slide: &Path) -> String {
        slide.display().to_string()
    }

    fn with_log(
        &self,
        slide: &Path,
        stage: StageName,
        log_name: LogName,
        body: impl FnOnce(&SlideLayout, &RunLog) -> Vec<StageOutcome>,
    ) -> Vec<StageOutcome> {
        let opened = self.layout(slide).and_then(|layout| {
            let log = RunLog::open(&layout.log_path(log_name))?;
            Ok((layout, log))
        });
        let (layout, log) = match opened {
            Ok(opened) => opened,
            Err(err) => return vec![unlogged_failure(&Self::slide_name(slide), stage, &err)],
        };
        let outcomes = body(&layout, &log);
        if let Err(err) = log.close() {
            error!("{err:#}");
        }
        outcomes
    }

    fn run_single<S: SlideStage>(&self, slide: &Path, stage: &S, log_name: LogName) -> StageOutcome {
        let mut outcomes = self.with_log(slide, stage.name(), log_name, |layout, log| {
            let result = run_logged(stage, layout, log);
            vec![finish(stage, layout, log, result, StageStatus::Failed)]
        });
        outcomes.remove(0)
    }

    /// Split the slide into patches.
    pub fn patch(&self, slide: &Path) -> StageOutcome {
        self.run_single(slide, &ExtractPatches::new(&self.params), LogName::Patch)
    }

    /// Count and draw nuclei from artifacts already on disk.
    pub fn count(&self, slide: &Path) -> StageOutcome {
        self.run_single(slide, &CountNuclei::new(&self.params), LogName::Predict)
    }

    /// Segment the tissue tiles, then count and draw the nuclei. A counting
    /// failure after a successful segmentation is a partial failure.
    pub fn predict(&self, slide: &Path, segmentor: &dyn NucleusSegmentor) -> Vec<StageOutcome> {
        self.with_log(slide, StageName::Predict, LogName::Predict, |layout, log| {
            let predict = PredictNuclei::new(segmentor);
            let result = run_logged(&predict, layout, log);
            let predicted = finish(&predict, layout, log, result, StageStatus::Failed);
            if !predicted.success {
                return vec![predicted];
            }
            let count = CountNuclei::new(&self.params);
            let result = run_logged(&count, layout, log);
            let counted = finish(&count, layout, log, result, StageStatus::PartialFailure);
            vec![predicted, counted]
        })
    }

    /// Stitch blank and overlay tiles into the merged image.
    pub fn merge(&self, slide: &Path) -> StageOutcome {
        self.run_single(slide, &MergeTiles::new(&self.params), LogName::Merge)
    }

    fn without_tissue(&self, slide: &Path) -> bool {
        self.layout(slide)
            .and_then(|layout| has_tissue(&layout))
            .is_ok_and(|tissue| !tissue)
    }

    /// Every step for one slide, stopping at the first step that does not
    /// complete. A slide without tissue has nothing to predict; its blank
    /// tiles are still merged.
    pub fn run(&self, slide: &Path, segmentor: &dyn NucleusSegmentor) -> Vec<StageOutcome> {
        let patched = self.patch(slide);
        if !patched.success {
            return vec![patched];
        }
        let mut outcomes = vec![patched];
        outcomes.extend(self.predict(slide, segmentor));
        if outcomes.iter().all(|outcome| outcome.success) || self.without_tissue(slide) {
            outcomes.push(self.merge(slide));
        }
        outcomes
    }

    /// Run every slide; a failing slide does not stop the batch.
    pub fn run_batch(
        &self,
        slides: &[PathBuf],
        segmentor: &dyn NucleusSegmentor,
    ) -> Vec<StageOutcome> {
        slides
            .iter()
            .flat_map(|slide| self.run(slide, segmentor))
            .collect()
    }
}
