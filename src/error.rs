// ABOUTME: Defines all error types for the trawl library using thiserror.
// ABOUTME: Each component has its own error enum, unified under TrawlError.

use std::time::Duration;

/// Top-level error type for the trawl library.
#[derive(Debug, thiserror::Error)]
pub enum TrawlError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TrawlError {
    /// Whether the caller should try again later rather than give up.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrawlError::Pool(e) => e.is_retryable(),
            TrawlError::Automation(e) => e.is_transient(),
            TrawlError::Discovery(e) => e.is_retryable(),
            TrawlError::Store(StoreError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

/// Errors from session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session validation failed: {0}")]
    ValidationFailed(String),

    #[error("Session {id} is {status} and cannot be used")]
    Unusable { id: String, status: String },

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No worker available after {waited:?}")]
    NoWorkerAvailable { waited: Duration },

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("Automation task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Failed to initialize worker slot {slot}: {source}")]
    SlotInit {
        slot: usize,
        #[source]
        source: AutomationError,
    },

    #[error("Pool is shut down")]
    ShutDown,

    #[error("Automation failed: {0}")]
    Automation(#[from] AutomationError),
}

impl PoolError {
    /// Timeouts and transient automation failures are worth retrying later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::NoWorkerAvailable { .. } | PoolError::TaskTimeout(_) => true,
            PoolError::Automation(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Errors from the automation capability.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Transient automation failure: {0}")]
    Transient(String),

    #[error("Session rejected by target: {0}")]
    SessionInvalid(String),

    #[error("Blocked by target: {0}")]
    Blocked(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("Automation instance is shut down")]
    ShutDown,
}

impl AutomationError {
    /// Transient errors are retried at the pool layer; the rest are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AutomationError::Transient(_) | AutomationError::Http(_) => true,
            AutomationError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the failure means the session itself should not be reused.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            AutomationError::SessionInvalid(_) | AutomationError::Blocked(_)
        )
    }
}

/// Errors from the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflicting {kind} already exists: {existing_id}")]
    Conflict {
        kind: &'static str,
        existing_id: String,
    },
}

/// Errors from the cipher capability.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Errors surfaced by a discovery run.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("No session available after {waited:?}")]
    NoSessionAvailable { waited: Duration },

    #[error("Not admitted ({reason}), retry after {retry_after_ms}ms")]
    NotAdmitted { reason: String, retry_after_ms: u64 },

    #[error("Worker pool unavailable: {0}")]
    Unavailable(#[source] PoolError),

    #[error("Discovery cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl DiscoveryError {
    /// Unavailability and non-admission are "try later", not hard failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NoSessionAvailable { .. }
                | DiscoveryError::NotAdmitted { .. }
                | DiscoveryError::Unavailable(_)
        )
    }
}

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}
