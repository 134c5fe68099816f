use std::time::Duration;

/// Document store failures. A missing document is not an error: `read`
/// returns `None` instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid document key: {0:?}")]
    InvalidKey(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("I/O failure on {key} after {attempts} attempt(s): {source}")]
    Io {
        key: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    Timeout { key: String, waited: Duration },
    #[error("cancelled while waiting for lock on {0}")]
    Cancelled(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RateError {
    #[error("cost {cost} can never fit the budget of scope {scope}")]
    Unsatisfiable { scope: String, cost: u32 },
    #[error("cancelled while waiting for budget on {0}")]
    Cancelled(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module {module} failed to initialize: {reason}")]
    Init { module: String, reason: String },
    #[error("module {module} failed to tear down: {reason}")]
    Teardown { module: String, reason: String },
    #[error("module {0} is not registered")]
    Unknown(String),
    #[error("module {module}: illegal transition {from} -> {to}")]
    InvalidTransition {
        module: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("module {0} is already registered")]
    Duplicate(String),
    #[error(transparent)]
    Core(#[from] Box<CoreError>),
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("connector rejected send to {target}: {reason}")]
    Connector { target: String, reason: String },
    #[error(transparent)]
    Rate(#[from] RateError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error handed back to feature-module handlers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Outbound(#[from] OutboundError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Text safe to show the actor. Never carries internal fault details.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Lock(LockError::Timeout { .. }) => {
                "I'm a bit busy right now, try again in a moment."
            }
            Self::Lock(LockError::Cancelled(_))
            | Self::Outbound(OutboundError::Rate(RateError::Cancelled(_))) => {
                "That request was interrupted, try again later."
            }
            Self::Store(_) | Self::Outbound(_) | Self::Config(_) => {
                "Something went wrong on my end, try again later."
            }
        }
    }
}

impl From<CoreError> for ModuleError {
    fn from(err: CoreError) -> Self {
        ModuleError::Core(Box::new(err))
    }
}
