//! Error types for the task bot.

use uuid::Uuid;

/// Reply used whenever a collaborator (store, gateway, queue) fails.
pub const GENERIC_FAILURE_REPLY: &str = "Something went wrong. Please try the command again.";

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl Error {
    /// Text shown to the chat when an operation ends with this error.
    ///
    /// Validation and task errors carry their own corrective wording;
    /// everything else collapses into one generic failure reply.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(e) => e.to_string(),
            Error::Task(e) => e.to_string(),
            _ => GENERIC_FAILURE_REPLY.to_string(),
        }
    }

    /// Whether this error comes from an external collaborator rather than user input.
    pub fn is_collaborator_failure(&self) -> bool {
        !matches!(self, Error::Validation(_) | Error::Task(_))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Malformed command arguments. Displayed verbatim to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{prompt}")]
    MissingArgument { prompt: &'static str },

    #[error("Wrong command format. Use: {usage}")]
    MissingSeparator { usage: &'static str },

    #[error("Invalid difficulty. Use a number from 1 to 5.")]
    InvalidDifficulty,

    #[error("Invalid date format. Use: YYYY-MM-DD HH:MM")]
    InvalidDate,

    #[error("{0}")]
    EmptyField(&'static str),
}

/// Store outcomes that are not failures but still end the operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Zero records matched, or the update changed nothing. Not distinguished.
    #[error("Task not found, or nothing was changed.")]
    NotFoundOrUnchanged,

    #[error("A task named \"{description}\" already exists.")]
    Duplicate { description: String },
}

/// Delayed job errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for job {name}")]
    NoHandler { name: String },

    #[error("Job {id} payload could not be decoded: {reason}")]
    BadPayload { id: Uuid, reason: String },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
