//! Progress and lifecycle notifications emitted by the driver.
//!
//! Callers observe a build through a set of optional callbacks. Every
//! emit helper is a no-op when the corresponding callback is absent, and
//! callbacks are expected not to panic; the driver never depends on
//! their behavior.

use std::sync::Arc;

use crate::artifacts::ArtifactMetadata;

/// The seven build stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadToolchain,
    CacheCheck,
    StageSources,
    PrepareBuild,
    Compile,
    Link,
    Publish,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::LoadToolchain => "loading toolchain",
            Stage::CacheCheck => "checking artifact cache",
            Stage::StageSources => "staging sources",
            Stage::PrepareBuild => "preparing build",
            Stage::Compile => "compiling",
            Stage::Link => "linking",
            Stage::Publish => "publishing",
        }
    }

    /// Progress estimate reported when the stage begins.
    pub fn progress(&self) -> u8 {
        match self {
            Stage::LoadToolchain => 5,
            Stage::CacheCheck => 15,
            Stage::StageSources => 25,
            Stage::PrepareBuild => 35,
            Stage::Compile => 45,
            Stage::Link => 75,
            Stage::Publish => 95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Started,
    Finished,
}

type ProgressFn = dyn Fn(u8, &str) + Send + Sync;
type StageFn = dyn Fn(Stage, StageStatus) + Send + Sync;
type OutputFn = dyn Fn(&str) + Send + Sync;
type ErrorFn = dyn Fn(&str) + Send + Sync;
type CompleteFn = dyn Fn(&[u8], &ArtifactMetadata) + Send + Sync;

/// Optional observer callbacks for a driver.
#[derive(Default)]
pub struct EventSink {
    pub on_progress: Option<Box<ProgressFn>>,
    pub on_stage: Option<Box<StageFn>>,
    /// Shared (not boxed) so it can be combined into per-invocation
    /// output sinks.
    pub on_output: Option<Arc<OutputFn>>,
    pub on_error: Option<Box<ErrorFn>>,
    pub on_complete: Option<Box<CompleteFn>>,
}

impl EventSink {
    pub fn progress(&self, pct: u8, message: &str) {
        if let Some(callback) = &self.on_progress {
            callback(pct, message);
        }
    }

    pub fn stage(&self, stage: Stage, status: StageStatus) {
        if let Some(callback) = &self.on_stage {
            callback(stage, status);
        }
    }

    pub fn output(&self, text: &str) {
        if let Some(callback) = &self.on_output {
            callback(text);
        }
    }

    pub fn error(&self, message: &str) {
        if let Some(callback) = &self.on_error {
            callback(message);
        }
    }

    pub fn complete(&self, bytes: &[u8], metadata: &ArtifactMetadata) {
        if let Some(callback) = &self.on_complete {
            callback(bytes, metadata);
        }
    }

    pub fn output_handler(&self) -> Option<Arc<OutputFn>> {
        self.on_output.as_ref().map(Arc::clone)
    }
}
