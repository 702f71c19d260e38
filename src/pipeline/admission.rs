/// Soft backpressure gate over per-owner in-flight jobs. Rejected requests
/// are not queued; the caller retries after a running job finishes. The
/// authoritative count is re-taken inside the creation transaction; this type
/// carries the configured ceiling and the decision rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionController {
    ceiling: i64,
}

impl AdmissionController {
    pub fn new(ceiling: i64) -> Self {
        Self {
            ceiling: ceiling.max(1),
        }
    }

    pub fn ceiling(self) -> i64 {
        self.ceiling
    }

    pub fn would_admit(self, in_flight: i64) -> bool {
        in_flight < self.ceiling
    }
}
