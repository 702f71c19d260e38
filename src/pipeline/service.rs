use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::db::jobs::{
    AccountDefaults, CancelOutcome, JobHistoryPage, JobKind, JobRecord, JobStatus, JobStore,
    JobStoreError, LedgerBalance, NewJob,
};
use crate::pipeline::admission::AdmissionController;
use crate::pipeline::refund;
use crate::storage::ArtifactStore;

/// Deployment knobs for the job service. Costs are per job kind and come out
/// of the owner's token balance at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub max_active_jobs: i64,
    pub default_token_limit: i64,
    pub default_tier: String,
    pub generate_cost: i64,
    pub modify_cost: i64,
    pub enhance_cost: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: 3,
            default_token_limit: 100,
            default_tier: String::from("standard"),
            generate_cost: 10,
            modify_cost: 8,
            enhance_cost: 5,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_active_jobs: parse_positive_env(
                std::env::var("ATELIER_MAX_ACTIVE_JOBS").ok(),
                defaults.max_active_jobs,
            ),
            default_token_limit: parse_positive_env(
                std::env::var("ATELIER_DEFAULT_TOKEN_LIMIT").ok(),
                defaults.default_token_limit,
            ),
            default_tier: defaults.default_tier,
            generate_cost: parse_positive_env(
                std::env::var("ATELIER_COST_GENERATE").ok(),
                defaults.generate_cost,
            ),
            modify_cost: parse_positive_env(
                std::env::var("ATELIER_COST_MODIFY").ok(),
                defaults.modify_cost,
            ),
            enhance_cost: parse_positive_env(
                std::env::var("ATELIER_COST_ENHANCE").ok(),
                defaults.enhance_cost,
            ),
        }
    }

    pub fn cost_for(&self, kind: JobKind) -> i64 {
        match kind {
            JobKind::Generate => self.generate_cost,
            JobKind::Modify => self.modify_cost,
            JobKind::Enhance => self.enhance_cost,
        }
    }

    pub fn account_defaults(&self) -> AccountDefaults {
        AccountDefaults {
            token_limit: self.default_token_limit,
            tier: self.default_tier.clone(),
        }
    }
}

fn parse_positive_env(raw: Option<String>, default: i64) -> i64 {
    raw.as_deref()
        .map(str::trim)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct CreateJobInput {
    pub owner_id: String,
    pub kind: JobKind,
    pub prompt: String,
    pub input_url: Option<String>,
    pub input_b64: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job: JobRecord,
    pub remaining_tokens: i64,
}

#[derive(Debug, Error)]
pub enum CreateJobError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("active job ceiling reached ({in_flight} of {ceiling} in flight)")]
    AdmissionRejected { in_flight: i64, ceiling: i64 },

    #[error("insufficient token balance: need {needed}, have {remaining}")]
    InsufficientBalance { needed: i64, remaining: i64 },

    #[error("input staging failed: {0}")]
    Staging(String),

    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for CreateJobError {
    fn from(error: JobStoreError) -> Self {
        match error {
            JobStoreError::Validation(message) => Self::InvalidRequest(message),
            JobStoreError::AdmissionRejected { in_flight, ceiling } => {
                Self::AdmissionRejected { in_flight, ceiling }
            }
            JobStoreError::InsufficientBalance { needed, remaining } => {
                Self::InsufficientBalance { needed, remaining }
            }
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelRejection {
    NotFound,
    Forbidden,
    AlreadyTerminal(JobStatus),
}

impl CancelRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Forbidden => "forbidden",
            Self::AlreadyTerminal(_) => "already terminal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelResult {
    pub cancelled: bool,
    pub refunded: bool,
    pub rejection: Option<CancelRejection>,
    pub job: Option<JobRecord>,
}

/// Front door for job operations: validation, input staging, admission and
/// the ledger debit. Execution is the runner's business.
#[derive(Clone)]
pub struct JobService {
    store: Arc<JobStore>,
    admission: AdmissionController,
    artifacts: Arc<dyn ArtifactStore>,
    config: ServiceConfig,
}

impl JobService {
    pub fn new(
        store: Arc<JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        config: ServiceConfig,
    ) -> Self {
        let admission = AdmissionController::new(config.max_active_jobs);
        Self {
            store,
            admission,
            artifacts,
            config,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn create_job(&self, input: CreateJobInput) -> Result<CreatedJob, CreateJobError> {
        let owner = input.owner_id.trim().to_string();
        if owner.is_empty() {
            return Err(CreateJobError::InvalidRequest(String::from(
                "Field 'owner_id' is required",
            )));
        }

        let prompt = input.prompt.trim().to_string();
        if prompt.is_empty() && input.kind != JobKind::Enhance {
            return Err(CreateJobError::InvalidRequest(format!(
                "Field 'prompt' is required for {} jobs",
                input.kind.as_str()
            )));
        }

        let input_url = normalized(input.input_url);
        let input_b64 = normalized(input.input_b64);

        let staged_input = match input.kind {
            JobKind::Generate => {
                if input_url.is_some() || input_b64.is_some() {
                    return Err(CreateJobError::InvalidRequest(String::from(
                        "Input images are not allowed for generate jobs",
                    )));
                }
                None
            }
            JobKind::Modify | JobKind::Enhance => match (input_url, input_b64) {
                (Some(_), Some(_)) => {
                    return Err(CreateJobError::InvalidRequest(String::from(
                        "Provide only one of: input_url, input_b64",
                    )));
                }
                (None, None) => {
                    return Err(CreateJobError::InvalidRequest(format!(
                        "Field 'input_url' or 'input_b64' is required for {} jobs",
                        input.kind.as_str()
                    )));
                }
                (Some(url), None) => Some(url),
                (None, Some(encoded)) => Some(self.stage_inline_input(encoded.as_str())?),
            },
        };

        let cost = self.config.cost_for(input.kind);
        let (job, remaining_tokens) = self.store.create_job_charged(
            NewJob {
                owner_id: owner,
                kind: input.kind,
                cost,
                prompt,
                input_url: staged_input,
            },
            self.admission.ceiling(),
        )?;

        info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            kind = job.kind.as_str(),
            cost,
            remaining = remaining_tokens,
            "job admitted and charged"
        );
        Ok(CreatedJob {
            job,
            remaining_tokens,
        })
    }

    fn stage_inline_input(&self, encoded: &str) -> Result<String, CreateJobError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| {
                CreateJobError::InvalidRequest(String::from(
                    "Field 'input_b64' is not valid base64",
                ))
            })?;
        if bytes.is_empty() {
            return Err(CreateJobError::InvalidRequest(String::from(
                "Field 'input_b64' decodes to an empty payload",
            )));
        }
        let key = format!("inputs/in_{}.bin", Uuid::new_v4().simple());
        let artifact = self
            .artifacts
            .put(key.as_str(), bytes.as_slice(), "application/octet-stream")
            .map_err(|e| CreateJobError::Staging(e.to_string()))?;
        Ok(artifact.url)
    }

    /// Applies the cancellation guard and, when the cancel wins, returns the
    /// job's tokens. A cancelled job stays CANCELLED; the ledger refund row is
    /// the audit trail.
    pub fn cancel_job(&self, job_id: &str, owner_id: &str) -> Result<CancelResult, JobStoreError> {
        match self.store.cancel_if_active(job_id, owner_id)? {
            CancelOutcome::Cancelled(job) => {
                let refunded = refund::refund_after_cancel(self.store.as_ref(), &job);
                info!(job_id = %job.id, owner_id = %job.owner_id, refunded, "job cancelled");
                Ok(CancelResult {
                    cancelled: true,
                    refunded,
                    rejection: None,
                    job: Some(job),
                })
            }
            CancelOutcome::NotFound => Ok(rejected(CancelRejection::NotFound, None)),
            CancelOutcome::Forbidden => Ok(rejected(CancelRejection::Forbidden, None)),
            CancelOutcome::AlreadyTerminal(status) => {
                let job = self.store.get_job(job_id, Some(owner_id)).ok();
                Ok(rejected(CancelRejection::AlreadyTerminal(status), job))
            }
        }
    }

    pub fn get_job(&self, job_id: &str, owner_id: Option<&str>) -> Result<JobRecord, JobStoreError> {
        self.store.get_job(job_id, owner_id)
    }

    pub fn job_history(
        &self,
        owner_id: &str,
        limit: i64,
        offset: i64,
        kind: Option<JobKind>,
    ) -> Result<JobHistoryPage, JobStoreError> {
        self.store.job_history(owner_id, limit, offset, kind)
    }

    pub fn get_balance(&self, owner_id: &str) -> Result<LedgerBalance, JobStoreError> {
        self.store.get_balance(owner_id)
    }
}

fn rejected(rejection: CancelRejection, job: Option<JobRecord>) -> CancelResult {
    CancelResult {
        cancelled: false,
        refunded: false,
        rejection: Some(rejection),
        job,
    }
}

fn normalized(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Builds the store and service from one config so the account defaults the
/// ledger applies always match the service's token limit.
pub fn build_service(
    db_path: impl AsRef<Path>,
    artifacts: Arc<dyn ArtifactStore>,
    config: ServiceConfig,
) -> JobService {
    let store = Arc::new(JobStore::new(
        db_path.as_ref().to_path_buf(),
        config.account_defaults(),
    ));
    JobService::new(store, artifacts, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalArtifactStore;
    use pretty_assertions::assert_eq;

    fn temp_service(config: ServiceConfig) -> JobService {
        let suffix = Uuid::new_v4().to_string();
        let root = std::env::temp_dir().join(format!("atelier_service_{suffix}"));
        std::fs::create_dir_all(root.as_path()).expect("temp root must be creatable");
        let artifacts = Arc::new(LocalArtifactStore::new(root.join("var/artifacts")));
        build_service(root.join("var/backend/app.db"), artifacts, config)
    }

    fn generate_input(owner: &str) -> CreateJobInput {
        CreateJobInput {
            owner_id: String::from(owner),
            kind: JobKind::Generate,
            prompt: String::from("a lighthouse at dusk"),
            input_url: None,
            input_b64: None,
        }
    }

    #[test]
    fn create_charges_the_kind_specific_cost() {
        let service = temp_service(ServiceConfig::default());
        let created = service
            .create_job(generate_input("ava"))
            .expect("job should be created");

        assert_eq!(created.job.cost, 10);
        assert_eq!(created.remaining_tokens, 90);
        assert_eq!(service.get_balance("ava").unwrap().remaining, 90);
    }

    #[test]
    fn generate_rejects_input_images() {
        let service = temp_service(ServiceConfig::default());
        let err = service
            .create_job(CreateJobInput {
                input_url: Some(String::from("file:///tmp/in.png")),
                ..generate_input("ava")
            })
            .expect_err("generate with input should be rejected");
        assert!(matches!(err, CreateJobError::InvalidRequest(_)));
    }

    #[test]
    fn modify_requires_exactly_one_input_source() {
        let service = temp_service(ServiceConfig::default());
        let base = CreateJobInput {
            kind: JobKind::Modify,
            prompt: String::from("make it night"),
            ..generate_input("ava")
        };

        let none = service
            .create_job(base.clone())
            .expect_err("modify without input should be rejected");
        assert!(matches!(none, CreateJobError::InvalidRequest(_)));

        let both = service
            .create_job(CreateJobInput {
                input_url: Some(String::from("file:///tmp/in.png")),
                input_b64: Some(String::from("aGVsbG8=")),
                ..base.clone()
            })
            .expect_err("modify with two inputs should be rejected");
        assert!(matches!(both, CreateJobError::InvalidRequest(_)));

        let created = service
            .create_job(CreateJobInput {
                input_url: Some(String::from("file:///tmp/in.png")),
                ..base
            })
            .expect("modify with one input should be created");
        assert_eq!(created.job.kind, JobKind::Modify);
        assert_eq!(created.job.cost, 8);
    }

    #[test]
    fn enhance_allows_empty_prompt_but_needs_input() {
        let service = temp_service(ServiceConfig::default());
        let created = service
            .create_job(CreateJobInput {
                owner_id: String::from("ava"),
                kind: JobKind::Enhance,
                prompt: String::new(),
                input_url: Some(String::from("file:///tmp/in.png")),
                input_b64: None,
            })
            .expect("enhance without prompt should be created");
        assert_eq!(created.job.cost, 5);
        assert_eq!(created.job.prompt, "");

        let err = service
            .create_job(CreateJobInput {
                owner_id: String::from("ava"),
                kind: JobKind::Enhance,
                prompt: String::new(),
                input_url: None,
                input_b64: None,
            })
            .expect_err("enhance without input should be rejected");
        assert!(matches!(err, CreateJobError::InvalidRequest(_)));
    }

    #[test]
    fn inline_input_is_staged_to_a_local_artifact() {
        let service = temp_service(ServiceConfig::default());
        let created = service
            .create_job(CreateJobInput {
                owner_id: String::from("ava"),
                kind: JobKind::Modify,
                prompt: String::from("make it night"),
                input_url: None,
                input_b64: Some(String::from("aGVsbG8gd29ybGQ=")),
            })
            .expect("staged modify should be created");

        let staged = created.job.input_url.expect("input should be staged");
        assert!(staged.starts_with("file://"));
        let bytes = crate::storage::read_local_artifact(staged.as_str())
            .expect("staged input should read back");
        assert_eq!(bytes, b"hello world");

        let err = service
            .create_job(CreateJobInput {
                owner_id: String::from("ava"),
                kind: JobKind::Modify,
                prompt: String::from("make it night"),
                input_url: None,
                input_b64: Some(String::from("%%%not-base64%%%")),
            })
            .expect_err("bad base64 should be rejected");
        assert!(matches!(err, CreateJobError::InvalidRequest(_)));
    }

    #[test]
    fn admission_and_balance_errors_surface_typed() {
        let service = temp_service(ServiceConfig {
            max_active_jobs: 1,
            default_token_limit: 15,
            ..ServiceConfig::default()
        });
        service
            .create_job(generate_input("ava"))
            .expect("first job should be created");

        let busy = service
            .create_job(generate_input("ava"))
            .expect_err("second in-flight job should be rejected");
        assert!(matches!(
            busy,
            CreateJobError::AdmissionRejected {
                in_flight: 1,
                ceiling: 1
            }
        ));

        let broke = service
            .create_job(generate_input("noor"))
            .map(|_| ())
            .and_then(|()| service.create_job(generate_input("noor")).map(|_| ()));
        // noor has 15 tokens and a ceiling of 1: the second job is stopped by
        // admission before the balance matters.
        assert!(matches!(
            broke,
            Err(CreateJobError::AdmissionRejected { .. })
        ));
    }

    #[test]
    fn insufficient_balance_is_reported_with_amounts() {
        let service = temp_service(ServiceConfig {
            default_token_limit: 7,
            ..ServiceConfig::default()
        });
        let err = service
            .create_job(generate_input("ava"))
            .expect_err("cost above the limit should be rejected");
        assert!(matches!(
            err,
            CreateJobError::InsufficientBalance {
                needed: 10,
                remaining: 7
            }
        ));
    }

    #[test]
    fn cancel_reports_rejections_and_refunds_winners() {
        let service = temp_service(ServiceConfig::default());
        let created = service
            .create_job(generate_input("ava"))
            .expect("job should be created");
        let job_id = created.job.id.clone();

        let missing = service.cancel_job("job_missing", "ava").unwrap();
        assert_eq!(missing.rejection, Some(CancelRejection::NotFound));

        let foreign = service.cancel_job(job_id.as_str(), "noor").unwrap();
        assert_eq!(foreign.rejection, Some(CancelRejection::Forbidden));

        let won = service.cancel_job(job_id.as_str(), "ava").unwrap();
        assert!(won.cancelled);
        assert!(won.refunded);
        assert_eq!(service.get_balance("ava").unwrap().remaining, 100);

        let again = service.cancel_job(job_id.as_str(), "ava").unwrap();
        assert_eq!(
            again.rejection,
            Some(CancelRejection::AlreadyTerminal(JobStatus::Cancelled))
        );
        let reloaded = service.get_job(job_id.as_str(), Some("ava")).unwrap();
        assert_eq!(reloaded.status, JobStatus::Cancelled);
    }

    #[test]
    fn cancelling_a_failed_job_refunds_it_once() {
        let service = temp_service(ServiceConfig::default());
        let created = service
            .create_job(generate_input("ava"))
            .expect("job should be created");
        let store = service.store().clone();
        assert!(store
            .fail_if_processing(created.job.id.as_str(), "TIMEOUT", "Request timed out")
            .expect("failure should record"));

        let outcome = service
            .cancel_job(created.job.id.as_str(), "ava")
            .expect("cancel should run");
        assert!(outcome.cancelled);
        assert!(outcome.refunded);
        assert_eq!(service.get_balance("ava").unwrap().remaining, 100);

        // When the failure path's refund already landed, the cancel still
        // wins the transition but moves no tokens.
        let second = service
            .create_job(generate_input("ava"))
            .expect("job should be created");
        assert!(store
            .fail_if_processing(second.job.id.as_str(), "TIMEOUT", "Request timed out")
            .expect("failure should record"));
        let failed = store.get_job(second.job.id.as_str(), None).unwrap();
        assert!(matches!(
            store.refund_job(&failed, "failed").unwrap(),
            crate::db::jobs::RefundOutcome::Refunded { .. }
        ));

        let outcome = service
            .cancel_job(second.job.id.as_str(), "ava")
            .expect("cancel should run");
        assert!(outcome.cancelled);
        assert!(!outcome.refunded);
        assert_eq!(
            service.get_job(second.job.id.as_str(), None).unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(service.get_balance("ava").unwrap().remaining, 100);
    }

    #[test]
    fn env_parsing_ignores_junk_values() {
        assert_eq!(parse_positive_env(None, 3), 3);
        assert_eq!(parse_positive_env(Some(String::from("7")), 3), 7);
        assert_eq!(parse_positive_env(Some(String::from("-1")), 3), 3);
        assert_eq!(parse_positive_env(Some(String::from("lots")), 3), 3);
    }
}
