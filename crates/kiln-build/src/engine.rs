//! コンテナエンジンへの窓口
//!
//! オーケストレータは具体的なエンジン実装に依存せず、この capability
//! トレイト越しに inspect / pull / tag / push / build を呼ぶ。
//! 本番実装は bollard 経由の Docker デーモン。

use crate::context;
use crate::error::{BuildError, BuildResult};
use bollard::Docker;
use bollard::auth::DockerCredentials;
use colored::Colorize;
use futures_util::stream::StreamExt;
use kiln_core::model::ResourceLimits;
use std::collections::HashMap;
use std::path::PathBuf;

/// inspect が返すイメージレコードの抜粋
#[derive(Debug, Clone, Default)]
pub struct ImageRecord {
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
}

/// エンジンビルド 1 回分の指示
#[derive(Debug, Clone, Default)]
pub struct EngineBuildRequest {
    /// ビルド結果に付けるタグ
    pub tag: String,
    /// レシピコンテキストのディレクトリ
    pub context_dir: PathBuf,
    /// コンテキスト内のレシピファイル名
    pub recipe_file: String,
    /// ベースレイヤーを再取得するか
    pub pull: bool,
    pub no_cache: bool,
    /// リクエストからそのまま渡すリソース制限
    pub limits: Option<ResourceLimits>,
    /// エンジンレベルの pull に使う認証情報
    pub pull_credentials: Option<DockerCredentials>,
}

/// コンテナエンジンの capability トレイト
#[allow(async_fn_in_trait)]
pub trait ContainerEngine {
    /// イメージを inspect する。存在しない場合は `Ok(None)`。
    async fn inspect(&self, image: &str) -> BuildResult<Option<ImageRecord>>;
    async fn pull(&self, image: &str, credentials: Option<DockerCredentials>) -> BuildResult<()>;
    async fn tag(&self, source: &str, target: &str) -> BuildResult<()>;
    /// push 成功時、レジストリが返したコンテンツダイジェストを返す
    async fn push(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<Option<String>>;
    async fn build(&self, request: &EngineBuildRequest) -> BuildResult<()>;
}

/// bollard 経由の Docker デーモン実装
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// ビルド出力の処理
    fn handle_build_output(&self, output: bollard::models::BuildInfo) -> BuildResult<()> {
        if let Some(stream) = output.stream {
            // ビルドステップの出力はそのまま流す
            print!("{}", stream);
        }

        if let Some(error) = output.error {
            return Err(BuildError::EngineBuild(error));
        }

        if let Some(error_detail) = output.error_detail {
            let message = error_detail
                .message
                .unwrap_or_else(|| "Unknown build error".to_string());
            return Err(BuildError::EngineBuild(message));
        }

        if let Some(status) = output.status {
            // pull 等のステータスメッセージ
            println!("{}", status.cyan());
        }

        Ok(())
    }
}

impl ContainerEngine for DockerEngine {
    async fn inspect(&self, image: &str) -> BuildResult<Option<ImageRecord>> {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => {
                let config = inspect.config.unwrap_or_default();
                Ok(Some(ImageRecord {
                    user: config.user,
                    labels: config.labels.unwrap_or_default(),
                    env: config.env.unwrap_or_default(),
                    working_dir: config.working_dir,
                }))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(BuildError::ImageInspect {
                image: image.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn pull(&self, image: &str, credentials: Option<DockerCredentials>) -> BuildResult<()> {
        let (repository, tag) = split_image_tag(image);
        tracing::info!("Explicitly pulling image {}", image);

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image: repository.as_str(),
            tag: tag.as_str(),
            ..Default::default()
        };

        #[allow(deprecated)]
        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!("{}", status);
                    }
                    if let Some(error) = info.error {
                        return Err(BuildError::PullFailed {
                            image: image.to_string(),
                            message: error,
                        });
                    }
                }
                Err(e) => {
                    return Err(BuildError::PullFailed {
                        image: image.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> BuildResult<()> {
        let (repo, tag) = split_image_tag(target);

        #[allow(deprecated)]
        let options = bollard::image::TagImageOptions {
            repo: repo.as_str(),
            tag: tag.as_str(),
        };

        #[allow(deprecated)]
        self.docker
            .tag_image(source, Some(options))
            .await
            .map_err(|e| BuildError::PushFailed {
                image: target.to_string(),
                auth_context: "tagging before push".to_string(),
                message: e.to_string(),
            })
    }

    async fn push(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<Option<String>> {
        let (repository, tag) = split_image_tag(image);
        let auth_context = push_auth_context(image, credentials.is_some());

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> { tag };

        #[allow(deprecated)]
        let mut stream = self
            .docker
            .push_image(&repository, Some(options), credentials);

        let mut digest: Option<String> = None;
        let mut error_message: Option<String> = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(err) = info.error {
                        error_message = Some(err);
                    } else if let Some(status) = info.status {
                        if let Some(found) = parse_digest(&status) {
                            digest = Some(found);
                        }
                        tracing::debug!("{}", status);
                    }
                }
                Err(e) => {
                    return Err(BuildError::PushFailed {
                        image: image.to_string(),
                        auth_context,
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(err) = error_message {
            return Err(BuildError::PushFailed {
                image: image.to_string(),
                auth_context,
                message: err,
            });
        }

        Ok(digest)
    }

    async fn build(&self, request: &EngineBuildRequest) -> BuildResult<()> {
        tracing::info!("Building image: {}", request.tag);

        let limits = request.limits.clone().unwrap_or_default();
        if let Some(parent) = &limits.cgroup_parent {
            // Docker の build API には cgroup parent を渡す口がない
            tracing::warn!("cgroup parent {} not supported by the engine build, ignoring", parent);
        }

        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions {
            dockerfile: request.recipe_file.as_str(),
            t: request.tag.as_str(),
            nocache: request.no_cache,
            rm: true,
            forcerm: true,
            pull: request.pull,
            memory: limits.memory.map(|v| v as u64),
            memswap: limits.memory_swap,
            cpushares: limits.cpu_shares.map(|v| v as u64),
            cpuperiod: limits.cpu_period.map(|v| v as u64),
            cpuquota: limits.cpu_quota.map(|v| v as u64),
            ..Default::default()
        };

        let registry_credentials = request.pull_credentials.clone().map(|creds| {
            let registry = creds.serveraddress.clone().unwrap_or_default();
            HashMap::from([(registry, creds)])
        });

        let context_data = context::archive_context(&request.context_dir)?;

        use bytes::Bytes;
        use http_body_util::{Either, Full};
        let body = Full::new(Bytes::from(context_data));
        let mut stream =
            self.docker
                .build_image(options, registry_credentials, Some(Either::Left(body)));

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(output) => self.handle_build_output(output)?,
                Err(e) => return Err(BuildError::EngineBuild(e.to_string())),
            }
        }

        tracing::info!("Successfully built: {}", request.tag);
        Ok(())
    }
}

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app` -> `("localhost:5000/app", "latest")`
/// - ダイジェスト参照（`@` 入り）は丸ごとリポジトリ側に残す
pub fn split_image_tag(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // ポート番号（localhost:5000/app）はタグ扱いしない
        if !potential_tag.contains('/') && !potential_tag.chars().all(|c| c.is_ascii_digit()) {
            return (potential_image.to_string(), potential_tag.to_string());
        }
    }
    (image.to_string(), "latest".to_string())
}

/// push ステータス行からコンテンツダイジェストを取り出す
fn parse_digest(status: &str) -> Option<String> {
    let idx = status.find("digest: ")?;
    let rest = &status[idx + "digest: ".len()..];
    let digest: String = rest.split_whitespace().next()?.to_string();
    digest.starts_with("sha256:").then_some(digest)
}

/// 診断用の認証コンテキスト（認証情報の内容は含めない）
pub fn push_auth_context(image: &str, auth_present: bool) -> String {
    if auth_present {
        format!("using push credentials for {}", image)
    } else {
        "no push credentials provided".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_tag_with_tag() {
        let (image, tag) = split_image_tag("ghcr.io/org/app:v1.0");
        assert_eq!(image, "ghcr.io/org/app");
        assert_eq!(tag, "v1.0");
    }

    #[test]
    fn test_split_image_tag_without_tag() {
        let (image, tag) = split_image_tag("ghcr.io/org/app");
        assert_eq!(image, "ghcr.io/org/app");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_split_image_tag_with_port() {
        let (image, tag) = split_image_tag("localhost:5000/app");
        assert_eq!(image, "localhost:5000/app");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_split_image_tag_digest_reference() {
        let (image, tag) = split_image_tag("ghcr.io/org/app@sha256:deadbeef");
        assert_eq!(image, "ghcr.io/org/app@sha256:deadbeef");
        assert_eq!(tag, "");
    }

    #[test]
    fn test_parse_digest_from_status() {
        let status = "latest: digest: sha256:abcdef0123 size: 529";
        assert_eq!(parse_digest(status), Some("sha256:abcdef0123".to_string()));
    }

    #[test]
    fn test_parse_digest_ignores_other_statuses() {
        assert_eq!(parse_digest("Pushing [====>   ]"), None);
        assert_eq!(parse_digest("digest: md5:nope size: 1"), None);
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_inspect_missing_image_is_none() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let engine = DockerEngine::new(docker);
        let record = engine
            .inspect("kiln-test/does-not-exist:never")
            .await
            .unwrap();
        assert!(record.is_none());
    }
}
