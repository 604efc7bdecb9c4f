use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// 集約された設定エラー。検出した問題をすべて 1 つのメッセージにまとめる
    #[error("invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to inspect image {image}: {message}")]
    ImageInspect { image: String, message: String },

    #[error("failed to pull image {image}: {message}")]
    PullFailed { image: String, message: String },

    /// アセンブリデリゲートの構造化された失敗。
    /// reason / message はそのままビルドステータスに転記される。
    #[error("assembly failed: {reason}: {message}")]
    Assembly { reason: String, message: String },

    #[error("recipe processing failed: {0}")]
    Recipe(String),

    #[error("engine build failed: {0}")]
    EngineBuild(String),

    #[error("secure repackaging failed: {0}")]
    Repackaging(String),

    /// 認証情報の有無は文脈として残すが、内容は決して含めない
    #[error("failed to push image {image} ({auth_context}): {message}")]
    PushFailed {
        image: String,
        auth_context: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
