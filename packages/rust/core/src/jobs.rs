//! Columnar transform job runner.
//!
//! The transform itself is a black box: it is started with the location of the
//! latest export and the columnar output location, and reports its outcome
//! later through a job-state notification carrying the job id.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use chatlake_shared::{ChatlakeError, LaneKind, Result, TransformConfig};

/// Parameters handed to one transform job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub lane: LaneKind,
    pub run_id: String,
    /// Location of the export to convert.
    pub input_uri: String,
    /// Fixed columnar output location for the lane.
    pub output_uri: String,
}

/// Starts transform jobs without waiting for them.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Start a job and return its id.
    async fn start(&self, request: &JobRequest) -> Result<String>;
}

/// Spawns the configured command detached:
/// `<command> <args..> --input <uri> --output <uri> --job-id <id>`.
#[derive(Debug, Clone)]
pub struct CommandJobRunner {
    command: String,
    args: Vec<String>,
}

impl CommandJobRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &TransformConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl JobRunner for CommandJobRunner {
    async fn start(&self, request: &JobRequest) -> Result<String> {
        let job_id = Uuid::now_v7().to_string();

        let child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg("--input")
            .arg(&request.input_uri)
            .arg("--output")
            .arg(&request.output_uri)
            .arg("--job-id")
            .arg(&job_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit()) // Job logs go to parent stderr
            .spawn()
            .map_err(|e| {
                ChatlakeError::Trigger(format!(
                    "failed to start transform job: {e}. Is `{}` installed?",
                    self.command
                ))
            })?;

        info!(
            lane = %request.lane,
            run_id = %request.run_id,
            %job_id,
            pid = child.id(),
            "transform job started"
        );
        // Dropping the handle leaves the job running.
        drop(child);
        Ok(job_id)
    }
}
