use crate::config::ConfigError;
use crate::notify::NotifyError;
use crate::rpc::RpcError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    /// An error that crossed a stage boundary, tagged with the stage and item it came from
    #[error("{stage}: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<Error>,
    },
    #[error("{0}")]
    Pipeline(String),
}

impl Error {
    pub fn stage(stage: impl Into<String>, source: impl Into<Error>) -> Self {
        Error::Stage { stage: stage.into(), source: Box::new(source.into()) }
    }

    /// Innermost store error, if that is what failed
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Error::Store(e) => Some(e),
            Error::Stage { source, .. } => source.as_store(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
