use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-skywarden-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-skywarden-config-2 Version not available")]
    VersionNotAvailable,

    #[error("error-skywarden-config-3 Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("error-skywarden-config-4 Invalid timeout value: {value}")]
    InvalidTimeout { value: String },

    #[error("error-skywarden-config-5 Invalid DID: {did}")]
    InvalidDid { did: String },

    #[error("error-skywarden-config-6 Invalid URL for {name}: {value}")]
    InvalidUrl { name: String, value: String },

    #[error("error-skywarden-config-7 Unknown ruleset: {name}")]
    UnknownRuleset { name: String },

    #[error("error-skywarden-config-8 Unknown rule: {name}")]
    UnknownRule { name: String },

    #[error("error-skywarden-config-9 Rule {name} cannot run on {kind} events")]
    RuleKindMismatch { name: String, kind: String },
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("error-skywarden-consumer-1 Shard count must be greater than 0")]
    ShardCountZero,

    #[error("error-skywarden-consumer-2 Shard queue closed: {shard}")]
    ShardClosed { shard: usize },

    #[error("error-skywarden-consumer-3 Cursor read failed: {details}")]
    CursorReadFailed { details: String },

    #[error("error-skywarden-consumer-4 Cursor write failed: {details}")]
    CursorWriteFailed { details: String },

    #[error("error-skywarden-consumer-5 Repository snapshot fetch failed: {did}: {details}")]
    SnapshotFailed { did: String, details: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("error-skywarden-store-1 Redis pool creation failed: {details}")]
    PoolCreationFailed { details: String },

    #[error("error-skywarden-store-2 Redis connection failed: {source}")]
    ConnectionFailed {
        #[source]
        source: deadpool_redis::PoolError,
    },

    #[error("error-skywarden-store-3 Redis operation failed: {operation}: {source}")]
    RedisOperationFailed {
        operation: String,
        #[source]
        source: deadpool_redis::redis::RedisError,
    },

    #[error("error-skywarden-store-4 Set file could not be loaded: {path}: {details}")]
    SetLoadFailed { path: String, details: String },

    #[error("error-skywarden-store-5 Rules config could not be loaded: {path}: {details}")]
    RulesLoadFailed { path: String, details: String },
}

#[derive(Error, Debug)]
pub enum XrpcError {
    #[error("error-skywarden-xrpc-1 Request failed: {method}: {source}")]
    RequestFailed {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("error-skywarden-xrpc-2 Request timeout: {method}: exceeded {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("error-skywarden-xrpc-3 Not found: {method}")]
    NotFound { method: String },

    #[error("error-skywarden-xrpc-4 Unexpected status: {method}: {status}: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },

    #[error("error-skywarden-xrpc-5 Response could not be decoded: {method}: {details}")]
    InvalidResponse { method: String, details: String },
}

impl XrpcError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            XrpcError::RequestFailed { .. } | XrpcError::Timeout { .. } => true,
            XrpcError::Status { status, .. } => *status == 429 || *status >= 500,
            XrpcError::NotFound { .. } | XrpcError::InvalidResponse { .. } => false,
        }
    }
}

/// Failures that can occur while evaluating a single event.
///
/// None of these stop stream consumption; they are logged with the event
/// sequence number and the evaluation degrades around them.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("error-skywarden-engine-1 Account not found: {did}")]
    NotFound { did: String },

    #[error("error-skywarden-engine-2 Dependency unavailable: {component}: {details}")]
    Unavailable {
        component: &'static str,
        details: String,
    },

    #[error("error-skywarden-engine-3 Malformed input: {details}")]
    Malformed { details: String },

    #[error("error-skywarden-engine-4 Rule failed: {rule}: {details}")]
    RuleFailure { rule: String, details: String },

    #[error("error-skywarden-engine-5 Effect application failed: {effect}: {details}")]
    ApplyFailure { effect: String, details: String },
}

impl EngineError {
    pub(crate) fn unavailable(component: &'static str, err: impl std::fmt::Display) -> Self {
        EngineError::Unavailable {
            component,
            details: err.to_string(),
        }
    }

    pub(crate) fn malformed(details: impl Into<String>) -> Self {
        EngineError::Malformed {
            details: details.into(),
        }
    }

    /// Maps a remote call failure into the evaluation taxonomy.
    pub(crate) fn from_xrpc(component: &'static str, did: &str, err: XrpcError) -> Self {
        match err {
            XrpcError::NotFound { .. } => EngineError::NotFound {
                did: did.to_string(),
            },
            other => EngineError::unavailable(component, other),
        }
    }
}
