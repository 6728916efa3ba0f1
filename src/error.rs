use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    /// A handler chain ran before every mirror finished its initial list
    NotSynced(String),

    /// A hostname that does not round-trip to a service name and namespace
    InvalidHostname(String),

    /// A mutex/rwlock was poisoned by a panicking writer
    LockPoisoned(String),

    /// The watch source reported an error frame mid-stream
    Watch(String),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// Transient errors are expected before synchronization and are retried quietly
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NotSynced(_))
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}
