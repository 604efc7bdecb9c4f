use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("ビルドリクエストが見つかりません: {0}")]
    RequestNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
