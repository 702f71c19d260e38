use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::db::jobs::{JobKind, JobOutput, JobRecord, JobStatus, JobStore};
use crate::pipeline::classify::{classify, classify_panic, ClassifiedFailure, ExecutionError};
use crate::pipeline::refund;
use crate::provider::{GenerationProvider, GenerationRequest};
use crate::storage::{inspect_image_bytes, read_local_artifact, ArtifactStore};

const DEFAULT_ENHANCE_PROMPT: &str =
    "Enhance this image: improve sharpness, lighting and color balance without changing the composition.";

/// Detached executor for a single job. Runs on a blocking worker thread with
/// nothing awaiting it, so every failure, panics included, is caught here and
/// lands in the job record; the outside world observes progress only through
/// the store and the ledger.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<JobStore>,
    provider: Arc<dyn GenerationProvider>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        provider: Arc<dyn GenerationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            store,
            provider,
            artifacts,
        }
    }

    pub fn execute(&self, job_id: &str) {
        if let Err(db_error) = self.store.mark_started(job_id) {
            error!(job_id, error = %db_error, "could not record job start");
            return;
        }

        let job = match self.store.get_job(job_id, None) {
            Ok(job) => job,
            Err(db_error) => {
                error!(job_id, error = %db_error, "job vanished before execution");
                return;
            }
        };
        if job.status != JobStatus::Processing {
            info!(job_id, status = job.status.as_str(), "skipping execution: job is no longer processing");
            return;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_steps(&job)));
        match outcome {
            Ok(Ok(output)) => self.record_completion(&job, &output),
            Ok(Err(step_error)) => self.record_failure(&job, classify(&step_error)),
            Err(payload) => self.record_failure(&job, classify_panic(payload.as_ref())),
        }
    }

    fn run_steps(&self, job: &JobRecord) -> Result<JobOutput, ExecutionError> {
        let request = GenerationRequest {
            prompt: effective_prompt(job),
            size: None,
        };

        let bytes = match job.kind {
            JobKind::Generate => self.provider.generate(&request)?,
            JobKind::Modify | JobKind::Enhance => {
                let locator = job.input_url.as_deref().ok_or_else(|| {
                    ExecutionError::Input(String::from("job has no input artifact"))
                })?;
                let input = read_local_artifact(locator)
                    .map_err(|e| ExecutionError::Input(e.to_string()))?;
                self.provider
                    .modify(&request, input.as_slice(), "image/png")?
            }
        };

        let metadata = inspect_image_bytes(bytes.as_slice())
            .map_err(|e| ExecutionError::Metadata(e.to_string()))?;

        let key = format!("jobs/{}/output.png", job.id);
        let artifact = self
            .artifacts
            .put(key.as_str(), bytes.as_slice(), "image/png")
            .map_err(|e| ExecutionError::Upload(e.to_string()))?;

        Ok(JobOutput {
            url: artifact.url,
            width: metadata.width,
            height: metadata.height,
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256,
        })
    }

    fn record_completion(&self, job: &JobRecord, output: &JobOutput) {
        match self.store.complete_if_processing(job.id.as_str(), output) {
            Ok(true) => {
                info!(
                    job_id = %job.id,
                    owner_id = %job.owner_id,
                    kind = job.kind.as_str(),
                    width = output.width,
                    height = output.height,
                    "job completed"
                );
            }
            Ok(false) => {
                // Lost the race to a cancel; the canceller owns the refund.
                info!(job_id = %job.id, "job left processing before completion; output artifact orphaned");
            }
            Err(db_error) => {
                error!(job_id = %job.id, error = %db_error, "completed work could not be recorded");
            }
        }
    }

    fn record_failure(&self, job: &JobRecord, failure: ClassifiedFailure) {
        warn!(
            job_id = %job.id,
            code = failure.code.as_str(),
            message = %failure.message,
            "job execution failed"
        );
        match self
            .store
            .fail_if_processing(job.id.as_str(), failure.code.as_str(), failure.message.as_str())
        {
            Ok(true) => {
                refund::refund_after_failure(self.store.as_ref(), job);
            }
            Ok(false) => {
                info!(job_id = %job.id, "job left processing before the failure could be recorded");
            }
            Err(db_error) => {
                error!(job_id = %job.id, error = %db_error, "failure could not be recorded; manual reconciliation required");
            }
        }
    }
}

fn effective_prompt(job: &JobRecord) -> String {
    let trimmed = job.prompt.trim();
    if trimmed.is_empty() && job.kind == JobKind::Enhance {
        return String::from(DEFAULT_ENHANCE_PROMPT);
    }
    String::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::jobs::{AccountDefaults, NewJob};
    use crate::provider::{ProviderError, ProviderErrorKind};
    use crate::storage::LocalArtifactStore;
    use std::sync::Mutex;
    use uuid::Uuid;

    enum Script {
        Png { width: u32, height: u32 },
        Fail(ProviderError),
        PanicWithText(&'static str),
        PanicOpaque,
    }

    struct ScriptedProvider {
        script: Mutex<Script>,
    }

    impl ScriptedProvider {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }

        fn run(&self) -> Result<Vec<u8>, ProviderError> {
            match &*self.script.lock().expect("script mutex poisoned") {
                Script::Png { width, height } => Ok(png_bytes(*width, *height)),
                Script::Fail(error) => Err(error.clone()),
                Script::PanicWithText(text) => panic!("{text}"),
                Script::PanicOpaque => std::panic::panic_any(17_u32),
            }
        }
    }

    impl GenerationProvider for ScriptedProvider {
        fn generate(&self, _request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
            self.run()
        }

        fn modify(
            &self,
            _request: &GenerationRequest,
            _input: &[u8],
            _input_mime: &str,
        ) -> Result<Vec<u8>, ProviderError> {
            self.run()
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        image::RgbaImage::new(width, height)
            .write_to(&mut out, image::ImageFormat::Png)
            .expect("test png should encode");
        out.into_inner()
    }

    fn test_harness(limit: i64, script: Script) -> (Arc<JobStore>, JobRunner) {
        let suffix = Uuid::new_v4().to_string();
        let root = std::env::temp_dir().join(format!("atelier_runner_{suffix}"));
        std::fs::create_dir_all(root.as_path()).expect("temp root must be creatable");
        let store = Arc::new(JobStore::new(
            root.join("var/backend/app.db"),
            AccountDefaults {
                token_limit: limit,
                tier: String::from("standard"),
            },
        ));
        let artifacts = Arc::new(LocalArtifactStore::new(root.join("var/artifacts")));
        let runner = JobRunner::new(store.clone(), ScriptedProvider::new(script), artifacts);
        (store, runner)
    }

    fn create_generate_job(store: &JobStore, cost: i64) -> JobRecord {
        let (job, _) = store
            .create_job_charged(
                NewJob {
                    owner_id: String::from("ava"),
                    kind: JobKind::Generate,
                    cost,
                    prompt: String::from("a lighthouse at dusk"),
                    input_url: None,
                },
                3,
            )
            .expect("job should be created");
        job
    }

    #[test]
    fn successful_run_completes_with_artifact_metadata() {
        let (store, runner) = test_harness(
            100,
            Script::Png {
                width: 64,
                height: 32,
            },
        );
        let job = create_generate_job(&store, 10);

        runner.execute(job.id.as_str());

        let done = store.get_job(job.id.as_str(), None).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.output_width, Some(64));
        assert_eq!(done.output_height, Some(32));
        assert!(done.output_url.as_deref().unwrap().starts_with("file://"));
        assert!(done.output_sha256.is_some());
        assert!(done.processing_started_at.is_some());
        assert!(done.processing_completed_at.is_some());
        // Completed work keeps its debit.
        assert_eq!(store.get_balance("ava").unwrap().remaining, 90);
    }

    #[test]
    fn provider_timeout_text_lands_in_refunded_with_timeout_code() {
        let (store, runner) = test_harness(
            10,
            Script::Fail(ProviderError::upstream("upstream timeout")),
        );
        let job = create_generate_job(&store, 6);
        assert_eq!(store.get_balance("ava").unwrap().remaining, 4);

        runner.execute(job.id.as_str());

        let done = store.get_job(job.id.as_str(), None).unwrap();
        assert_eq!(done.status, JobStatus::Refunded);
        assert_eq!(done.error_code.as_deref(), Some("TIMEOUT"));
        assert_eq!(done.error_message.as_deref(), Some("upstream timeout"));
        assert_eq!(store.get_balance("ava").unwrap().remaining, 10);
    }

    #[test]
    fn structured_rate_limit_is_refunded_with_rate_limited_code() {
        let (store, runner) = test_harness(
            100,
            Script::Fail(ProviderError {
                kind: ProviderErrorKind::RateLimited,
                message: String::from("slow down"),
            }),
        );
        let job = create_generate_job(&store, 10);

        runner.execute(job.id.as_str());

        let done = store.get_job(job.id.as_str(), None).unwrap();
        assert_eq!(done.status, JobStatus::Refunded);
        assert_eq!(done.error_code.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(store.get_balance("ava").unwrap().remaining, 100);
    }

    #[test]
    fn cancelled_job_is_not_executed() {
        let (store, runner) = test_harness(
            100,
            Script::Png {
                width: 8,
                height: 8,
            },
        );
        let job = create_generate_job(&store, 10);
        assert!(matches!(
            store.cancel_if_active(job.id.as_str(), "ava").unwrap(),
            crate::db::jobs::CancelOutcome::Cancelled(_)
        ));

        runner.execute(job.id.as_str());

        let done = store.get_job(job.id.as_str(), None).unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(done.output_url.is_none());
    }

    #[test]
    fn string_panic_is_classified_like_any_failure_text() {
        let (store, runner) = test_harness(100, Script::PanicWithText("provider timed out hard"));
        let job = create_generate_job(&store, 10);

        runner.execute(job.id.as_str());

        let done = store.get_job(job.id.as_str(), None).unwrap();
        assert_eq!(done.status, JobStatus::Refunded);
        assert_eq!(done.error_code.as_deref(), Some("TIMEOUT"));
        assert_eq!(store.get_balance("ava").unwrap().remaining, 100);
    }

    #[test]
    fn opaque_panic_is_recorded_as_unknown_and_refunded() {
        let (store, runner) = test_harness(100, Script::PanicOpaque);
        let job = create_generate_job(&store, 10);

        runner.execute(job.id.as_str());

        let done = store.get_job(job.id.as_str(), None).unwrap();
        assert_eq!(done.status, JobStatus::Refunded);
        assert_eq!(done.error_code.as_deref(), Some("UNKNOWN"));
        assert_eq!(store.get_balance("ava").unwrap().remaining, 100);
    }

    #[test]
    fn modify_without_input_fails_as_generation_error() {
        let (store, runner) = test_harness(
            100,
            Script::Png {
                width: 8,
                height: 8,
            },
        );
        let (job, _) = store
            .create_job_charged(
                NewJob {
                    owner_id: String::from("ava"),
                    kind: JobKind::Modify,
                    cost: 8,
                    prompt: String::from("make it night"),
                    input_url: None,
                },
                3,
            )
            .expect("job should be created");

        runner.execute(job.id.as_str());

        let done = store.get_job(job.id.as_str(), None).unwrap();
        assert_eq!(done.status, JobStatus::Refunded);
        assert_eq!(done.error_code.as_deref(), Some("GENERATION_ERROR"));
    }
}
