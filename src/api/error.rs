use serde::Serialize;

/// Coarse failure category carried next to the machine-readable error code in
/// every non-2xx response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Ledger,
    Infra,
}
