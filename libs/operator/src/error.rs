pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors possible to occur during reconciliation or status polling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// Error in user input or AkkaCluster resource definition, typically missing fields.
    #[error("Invalid AkkaCluster resource: {0}")]
    UserInputError(String),

    /// OpenTelemetry trace id requested outside of a valid span context.
    #[error("invalid trace id")]
    InvalidTraceId,

    /// A child resource failed to serialize to JSON during subset comparison.
    #[error("failed to compare resources: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Short label used on the `reconcile_failure` metric.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError { .. } => "kube".to_owned(),
            Error::UserInputError(_) => "user_input".to_owned(),
            Error::InvalidTraceId => "invalid_trace_id".to_owned(),
            Error::SerializationError { .. } => "serialization".to_owned(),
        }
    }
}
