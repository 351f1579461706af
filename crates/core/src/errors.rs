//! Error types for the TaskSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. The action layer works with [`ActionError`], which
//! collapses everything into the kinds a UI can render a message for.

use serde::Serialize;
use thiserror::Error;

use crate::models::EntityType;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Remote(#[from] RemoteApiError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

// ---------------------------------------------------------------------------
// Vault errors
// ---------------------------------------------------------------------------

/// Errors from the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The supplied token was rejected before encryption (e.g. empty).
    #[error("invalid token: {0}")]
    Validation(String),

    /// No credential is stored for the user.
    #[error("no credential on file for user '{0}'")]
    NotConnected(String),

    /// The credential was encrypted with a key that is no longer configured.
    #[error("credential encrypted with unknown key id '{key_id}'; reconnect required")]
    UnknownKey { key_id: String },

    /// The ciphertext failed authentication (tampered, or wrong key material).
    #[error("credential failed authentication under key id '{key_id}'")]
    DecryptionFailed { key_id: String },

    /// AES-GCM encryption failed.
    #[error("credential encryption failed: {0}")]
    EncryptionFailed(String),

    /// The provider refused the token while connecting.
    #[error("token verification failed: {0}")]
    Remote(#[from] RemoteApiError),

    /// Database error while reading or writing the credential.
    #[error("vault database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Remote provider errors
// ---------------------------------------------------------------------------

/// Errors from the remote provider API.
#[derive(Debug, Error)]
pub enum RemoteApiError {
    /// HTTP-level transport error (network, TLS, timeout).
    #[error("remote HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// 401 / 403: the stored token is no longer accepted.
    #[error("remote rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    /// 429: the provider asked us to slow down.
    #[error("remote rate limit exceeded (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// 5xx from the provider.
    #[error("remote server error (HTTP {status}): {body}")]
    ServerError { status: u16, body: String },

    /// Any other non-success status.
    #[error("remote API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// The provider answered with something we could not interpret.
    #[error("remote response parse error: {0}")]
    ParseError(String),
}

impl RemoteApiError {
    /// Map a non-success HTTP status to the matching error variant.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status },
            429 => Self::RateLimited { retry_after_secs },
            500..=599 => Self::ServerError {
                status,
                body: body.into(),
            },
            _ => Self::ApiError {
                status,
                body: body.into(),
            },
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(e) => !e.is_decode() && !e.is_builder(),
            Self::RateLimited { .. } | Self::ServerError { .. } => true,
            Self::Unauthorized { .. } | Self::ApiError { .. } | Self::ParseError(_) => false,
        }
    }

    /// Whether the user must reconnect (the token itself is invalid).
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// 410 Gone on a delta fetch: the cursor expired and a full fetch is needed.
    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, Self::ApiError { status: 410, .. })
    }
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the sync orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another pass is already running for this user.
    #[error("sync already in progress for user '{user_id}'")]
    AlreadyRunning { user_id: String },

    /// The remote provider failed; entity types in `completed` were applied.
    #[error("sync aborted during {entity_type}: {source}")]
    Remote {
        entity_type: EntityType,
        completed: Vec<EntityType>,
        #[source]
        source: RemoteApiError,
    },

    /// Credential problems (not connected, undecryptable).
    #[error("sync vault error: {0}")]
    VaultError(#[from] VaultError),

    /// Database error during sync.
    #[error("sync database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// The spawned sync task panicked or was aborted.
    #[error("sync task failed: {0}")]
    TaskFailed(String),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The conflict does not exist for this user, or is already resolved.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// The stored payload could not be applied.
    #[error("invalid payload for conflict {id}: {detail}")]
    InvalidPayload { id: String, detail: String },

    /// Pushing the chosen payload to the provider failed.
    #[error("conflict remote error: {0}")]
    RemoteError(#[from] RemoteApiError),

    /// Credential problems while resolving.
    #[error("conflict vault error: {0}")]
    VaultError(#[from] VaultError),

    /// Database error when persisting conflict data.
    #[error("conflict database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored JSON document could not be (de)serialized.
    #[error("database JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from the notification subsystem.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Slack webhook delivery failed.
    #[error("Slack notification failed: {0}")]
    SlackError(String),

    /// HTTP error during notification delivery.
    #[error("notification HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Action-layer errors
// ---------------------------------------------------------------------------

/// Stable, machine-readable name of an [`ActionError`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ActionErrorKind {
    ValidationError,
    NotConnected,
    AlreadyInProgress,
    Forbidden,
    NotFound,
    DecryptionError,
    RemoteApiError,
    InternalError,
}

impl std::fmt::Display for ActionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Typed result error for the operations exposed to the UI/action layer.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not connected to the remote service")]
    NotConnected,

    #[error("a sync is already in progress")]
    AlreadyInProgress,

    #[error("access denied")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stored credential cannot be decrypted ({0}); reconnect required")]
    Decryption(String),

    #[error("remote service error: {message}")]
    RemoteApi {
        message: String,
        requires_reconnect: bool,
        completed_types: Vec<EntityType>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ActionError {
    pub fn kind(&self) -> ActionErrorKind {
        match self {
            Self::Validation(_) => ActionErrorKind::ValidationError,
            Self::NotConnected => ActionErrorKind::NotConnected,
            Self::AlreadyInProgress => ActionErrorKind::AlreadyInProgress,
            Self::Forbidden => ActionErrorKind::Forbidden,
            Self::NotFound(_) => ActionErrorKind::NotFound,
            Self::Decryption(_) => ActionErrorKind::DecryptionError,
            Self::RemoteApi { .. } => ActionErrorKind::RemoteApiError,
            Self::Internal(_) => ActionErrorKind::InternalError,
        }
    }

    fn remote(err: &RemoteApiError, completed_types: Vec<EntityType>) -> Self {
        Self::RemoteApi {
            message: err.to_string(),
            requires_reconnect: err.requires_reconnect(),
            completed_types,
        }
    }
}

impl From<VaultError> for ActionError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Validation(detail) => Self::Validation(detail),
            VaultError::NotConnected(_) => Self::NotConnected,
            VaultError::UnknownKey { .. } | VaultError::DecryptionFailed { .. } => {
                Self::Decryption(err.to_string())
            }
            VaultError::Remote(ref remote) => Self::remote(remote, Vec::new()),
            VaultError::EncryptionFailed(_) | VaultError::DatabaseError(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<SyncError> for ActionError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyRunning { .. } => Self::AlreadyInProgress,
            SyncError::Remote {
                ref source,
                ref completed,
                ..
            } => Self::remote(source, completed.clone()),
            SyncError::VaultError(e) => e.into(),
            SyncError::DatabaseError(_) | SyncError::TaskFailed(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<ConflictError> for ActionError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::NotFound(id) => Self::NotFound(format!("conflict {}", id)),
            ConflictError::RemoteError(ref remote) => Self::remote(remote, Vec::new()),
            ConflictError::VaultError(e) => e.into(),
            ConflictError::InvalidPayload { .. } | ConflictError::DatabaseError(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<DatabaseError> for ActionError {
    fn from(err: DatabaseError) -> Self {
        Self::Internal(err.to_string())
    }
}
