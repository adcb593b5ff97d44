use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskmillError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoder error: {message}")]
    Encoder { message: String },

    #[error("Connector error: {message}")]
    Connector { message: String },

    #[error("Lock error: {message}")]
    Lock { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Executor error: {message}")]
    Executor { message: String },

    #[error("Watchdog error: {message}")]
    Watchdog { message: String },

    #[error("Supervisor error: {message}")]
    Supervisor { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

// Add From implementations for toml errors
impl From<toml::de::Error> for TaskmillError {
    fn from(err: toml::de::Error) -> Self {
        TaskmillError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for TaskmillError {
    fn from(err: toml::ser::Error) -> Self {
        TaskmillError::Config(format!("TOML serialization error: {}", err))
    }
}

impl From<rmp_serde::encode::Error> for TaskmillError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        TaskmillError::Encoder {
            message: format!("MessagePack encode error: {}", err),
        }
    }
}

impl From<rmp_serde::decode::Error> for TaskmillError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        TaskmillError::Encoder {
            message: format!("MessagePack decode error: {}", err),
        }
    }
}
