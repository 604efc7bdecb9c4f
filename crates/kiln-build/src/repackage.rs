//! セキュア再パッケージ
//!
//! 機密実行環境向けに、ビルド済みイメージから実行時メタデータを抽出し、
//! ワンタイムシークレットで暗号化された派生イメージを作り直す分岐。
//! 各ステップは外部プロセスの起動で、どの失敗も実行を中断させる。

use crate::engine::{ContainerEngine, EngineBuildRequest};
use crate::error::{BuildError, BuildResult};
use bollard::auth::DockerCredentials;
use kiln_core::model::ResourceLimits;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// 実行時環境変数ディスクリプタを抽出するスクリプト
pub const ENV_EXTRACTOR: &str = "/usr/bin/extract_env.py";
/// 暗号化イメージを生成する再パッケージツール
pub const REPACKAGE_TOOL: &str = "/usr/bin/cw-build";
/// 再パッケージ後の最終イメージを組み立てる第二のコンテキスト
pub const REPACKAGE_CONTEXT_DIR: &str = "/tmp/kiln-cwcontext";
/// 再ビルド失敗時に待つクールダウン。
/// リソースの厳しい再パッケージバックエンドに対して、一時障害直後の
/// ホットループを避けるための意図的な遅延。
pub const REBUILD_COOLDOWN: Duration = Duration::from_secs(300);

/// 外部プロセス起動の capability トレイト
#[allow(async_fn_in_trait)]
pub trait ProcessRunner {
    /// コマンドを実行し stdout を返す。非 0 終了はエラー。
    async fn run(&self, command: &str, args: &[&str]) -> BuildResult<String>;
}

/// tokio::process ベースの本番実装
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: &str, args: &[&str]) -> BuildResult<String> {
        let output = tokio::process::Command::new(command)
            .args(args)
            .output()
            .await
            .map_err(|e| BuildError::Repackaging(format!("failed to run {}: {}", command, e)))?;

        if !output.status.success() {
            return Err(BuildError::Repackaging(format!(
                "{} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// 再パッケージの結果。push 後のアテステーション登録で使う。
#[derive(Debug, Clone)]
pub struct RepackageOutcome {
    /// 抽出した実行時環境変数（`KEY="value"` の空白区切り）
    pub env: String,
    /// イメージに設定されていた作業ディレクトリ
    pub workdir: String,
    /// ワンタイムアクセスシークレット
    pub secret: String,
}

pub struct SecureRepackager<'a, E, P> {
    engine: &'a E,
    runner: &'a P,
    cooldown: Duration,
    context_dir: PathBuf,
}

impl<'a, E: ContainerEngine, P: ProcessRunner> SecureRepackager<'a, E, P> {
    pub fn new(engine: &'a E, runner: &'a P) -> Self {
        Self {
            engine,
            runner,
            cooldown: REBUILD_COOLDOWN,
            context_dir: PathBuf::from(REPACKAGE_CONTEXT_DIR),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_context_dir(mut self, context_dir: PathBuf) -> Self {
        self.context_dir = context_dir;
        self
    }

    /// ビルド済みイメージを暗号化された派生イメージに作り直す
    pub async fn repackage(
        &self,
        build_tag: &str,
        force_pull: bool,
        limits: Option<&ResourceLimits>,
        pull_credentials: Option<DockerCredentials>,
    ) -> BuildResult<RepackageOutcome> {
        let env = self.runner.run("python3", &[ENV_EXTRACTOR, build_tag]).await?;
        tracing::debug!("extracted runtime env: {}", env);

        let workdir = self
            .runner
            .run(
                "buildah",
                &[
                    "inspect",
                    "--format",
                    "'{{.OCIv1.Config.WorkingDir}}'",
                    build_tag,
                ],
            )
            .await?
            .replace('\'', "")
            .trim()
            .to_string();
        tracing::debug!("extracted workdir: {}", workdir);

        let secret = Uuid::new_v4().to_string();
        let stdout = self
            .runner
            .run(REPACKAGE_TOOL, &[build_tag, &secret])
            .await?;
        tracing::debug!("repackage tool output: {}", stdout);

        tracing::info!("generating an image with the encrypted disk");
        let request = EngineBuildRequest {
            tag: build_tag.to_string(),
            context_dir: self.context_dir.clone(),
            recipe_file: crate::assembly::RECIPE_FILE_NAME.to_string(),
            pull: force_pull,
            no_cache: false,
            limits: limits.cloned(),
            pull_credentials,
        };
        if let Err(err) = self.engine.build(&request).await {
            tracing::error!("encrypted image generation failed: {}", err);
            tokio::time::sleep(self.cooldown).await;
            return Err(err);
        }

        Ok(RepackageOutcome {
            env: env.trim().to_string(),
            workdir,
            secret,
        })
    }
}
