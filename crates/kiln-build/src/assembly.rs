//! アセンブリ設定の組み立てとデリゲート呼び出し
//!
//! ビルドリクエストと introspection の結果から、アセンブリデリゲートに
//! 渡す統一設定を 1 度だけ組み立てる。環境変数のマージは map ベースで
//! last-write-wins、挿入順は保証しない（意図的な簡略化。下流は最終値
//! しか見ない）。

use crate::error::{BuildError, BuildResult};
use kiln_core::model::{BuildRequest, BuildVolumeSource, EnvVar, GitSourceInfo};
use kiln_core::timing::StageStep;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

/// 前段がソースツリーを展開する場所
pub const INPUT_SOURCE_DIR: &str = "/tmp/kiln-source";
/// 生成されたレシピとそのコンテキストの置き場所
pub const RECIPE_CONTEXT_DIR: &str = "/tmp/kiln-context";
/// コンテキスト内のレシピファイル名
pub const RECIPE_FILE_NAME: &str = "Dockerfile";
/// シークレットのマウント元ベースパス
pub const SECRET_MOUNT_BASE: &str = "/var/run/secrets/kiln.io/build";
/// config map のマウント元ベースパス
pub const CONFIG_MAP_MOUNT_BASE: &str = "/var/run/configs/kiln.io/build";
/// 自動生成ラベルの名前空間
pub const LABEL_NAMESPACE: &str = "io.kiln.build.";

/// スクリプトダウンロード用のプロキシ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<Url>,
}

/// アセンブリ中に注入されるボリューム
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// ホスト側のソースパス
    pub source: PathBuf,
    /// コンテナ内の展開先
    pub destination: String,
    /// アセンブリ後もイメージに残すか（シークレットは false）
    pub keep: bool,
}

/// アセンブリデリゲートに渡す統一設定
///
/// 1 回の実行が排他的に所有し、実行中にダウングレードされうる
/// （インクリメンタル pull 失敗で incremental が false になる等）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    pub builder_image: String,
    /// リクエストで指定されたスクリプト URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts_url: Option<String>,
    /// ビルダーイメージのラベルから導出したスクリプト URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_scripts_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assemble_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub incremental: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_from_tag: Option<String>,
    /// key=value に平坦化される環境変数（重複キーは last-write-wins）
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub source_dir: PathBuf,
    pub context_dir: String,
    pub force_copy: bool,
    pub injections: Vec<VolumeSpec>,
    /// アセンブリを直接実行せず、このパスにレシピを生成させる
    pub as_recipe_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    pub block_on_build: bool,
}

impl AssemblyConfig {
    /// 組み立て済み設定の検証。問題は fail-fast せずすべて集約する。
    pub fn validate(&self) -> BuildResult<()> {
        let mut problems = Vec::new();

        if self.builder_image.is_empty() {
            problems.push("builder image must not be empty".to_string());
        }
        if self.incremental && self.incremental_from_tag.is_none() {
            problems.push("incremental build requires a previous output tag".to_string());
        }
        for (key, _) in &self.environment {
            if key.is_empty() {
                problems.push("environment variable with empty name".to_string());
            }
        }
        for volume in &self.injections {
            if volume.destination.is_empty() {
                problems.push(format!(
                    "injected volume {} has no destination",
                    volume.source.display()
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BuildError::InvalidConfig(problems.join(", ")))
        }
    }
}

/// ビルドリクエストから AssemblyConfig を組み立てる
pub struct ConfigAssembler<'a> {
    request: &'a BuildRequest,
    source_info: Option<&'a GitSourceInfo>,
}

impl<'a> ConfigAssembler<'a> {
    pub fn new(request: &'a BuildRequest, source_info: Option<&'a GitSourceInfo>) -> Self {
        Self {
            request,
            source_info,
        }
    }

    pub fn assemble(&self, push_tag: &str) -> BuildResult<AssemblyConfig> {
        let strategy = &self.request.strategy;

        let mut injections = Vec::new();
        injections.extend(inject_volumes(
            &self.request.source.secrets,
            SECRET_MOUNT_BASE,
            false,
        ));
        injections.extend(inject_volumes(
            &self.request.source.config_maps,
            CONFIG_MAP_MOUNT_BASE,
            true,
        ));

        Ok(AssemblyConfig {
            builder_image: strategy.builder_image.clone(),
            scripts_url: strategy.scripts_url.clone(),
            image_scripts_url: None,
            assemble_user: None,
            destination: None,
            incremental: strategy.incremental,
            incremental_from_tag: strategy.incremental.then(|| push_tag.to_string()),
            environment: self.build_environment(),
            labels: self.build_labels(),
            source_dir: PathBuf::from(INPUT_SOURCE_DIR),
            context_dir: clean_context_dir(&self.request.source.context_dir),
            force_copy: true,
            injections,
            as_recipe_file: PathBuf::from(RECIPE_CONTEXT_DIR).join(RECIPE_FILE_NAME),
            proxy: script_proxy_config(&strategy.env)?,
            block_on_build: true,
        })
    }

    /// ビルドメタデータと戦略の環境変数をマージする。
    /// 後から入れたものが勝ち、順序は観測可能な保証ではない。
    fn build_environment(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("KILN_BUILD_NAME".to_string(), self.request.name.clone());
        env.insert(
            "KILN_BUILD_NAMESPACE".to_string(),
            self.request.namespace.clone(),
        );
        if let Some(git) = &self.request.source.git {
            env.insert("KILN_BUILD_SOURCE".to_string(), git.uri.clone());
            if !git.reference.is_empty() {
                env.insert("KILN_BUILD_REFERENCE".to_string(), git.reference.clone());
            }
        }
        if let Some(info) = self.source_info {
            if !info.commit_id.is_empty() {
                env.insert("KILN_BUILD_COMMIT".to_string(), info.commit_id.clone());
            }
            if !info.reference.is_empty() {
                env.entry("KILN_BUILD_REFERENCE".to_string())
                    .or_insert_with(|| info.reference.clone());
            }
        }
        for EnvVar { name, value } in &self.request.strategy.env {
            env.insert(name.clone(), value.clone());
        }
        env
    }

    /// ラベルの組み立て。優先順位は
    /// ソースメタデータ由来 < 明示的に要求された git ref < 呼び出し側の上書き。
    fn build_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();

        if let Some(info) = self.source_info {
            let mut put = |suffix: &str, value: &str| {
                if !value.is_empty() {
                    labels.insert(format!("{LABEL_NAMESPACE}{suffix}"), value.to_string());
                }
            };
            put("commit.id", &info.commit_id);
            put("commit.ref", &info.reference);
            put("commit.message", &info.message);
            put("commit.date", &info.date);
            if !info.author_name.is_empty() {
                put(
                    "commit.author",
                    &format!("{} <{}>", info.author_name, info.author_email),
                );
            }
            put("source-location", &info.location);
        }
        if !self.request.source.context_dir.is_empty() {
            labels.insert(
                format!("{LABEL_NAMESPACE}source-context-dir"),
                self.request.source.context_dir.clone(),
            );
        }

        // 明示的にチェックアウトを要求した ref は、チェックアウト済み
        // ツリーから導出した値と食い違うことがあるため上書きする
        if let Some(git) = &self.request.source.git
            && !git.reference.is_empty()
        {
            labels.insert(
                format!("{LABEL_NAMESPACE}commit.ref"),
                git.reference.clone(),
            );
        }

        // 呼び出し側の指定は自動生成ラベルを上書きする
        for label in &self.request.output.labels {
            labels.insert(label.name.clone(), label.value.clone());
        }

        labels
    }
}

/// シークレット / config map を VolumeSpec へ変換
fn inject_volumes(sources: &[BuildVolumeSource], base: &str, keep: bool) -> Vec<VolumeSpec> {
    sources
        .iter()
        .map(|src| {
            tracing::debug!(
                "Injecting build source {:?} into {:?}",
                src.name,
                src.destination_dir
            );
            VolumeSpec {
                source: PathBuf::from(base).join(&src.name),
                destination: src.destination_dir.clone(),
                keep,
            }
        })
        .collect()
}

/// 戦略の環境変数からスクリプトダウンロード用プロキシを決める。
/// 大文字小文字は区別せず、どちらも無ければ設定なし。
pub fn script_proxy_config(env: &[EnvVar]) -> BuildResult<Option<ProxyConfig>> {
    let mut http_proxy = String::new();
    let mut https_proxy = String::new();

    for EnvVar { name, value } in env {
        if name.eq_ignore_ascii_case("HTTP_PROXY") {
            http_proxy = value.clone();
        } else if name.eq_ignore_ascii_case("HTTPS_PROXY") {
            https_proxy = value.clone();
        }
    }

    if http_proxy.is_empty() && https_proxy.is_empty() {
        return Ok(None);
    }

    let parse = |value: &str| -> BuildResult<Option<Url>> {
        if value.is_empty() {
            return Ok(None);
        }
        Url::parse(value)
            .map(Some)
            .map_err(|e| BuildError::InvalidConfig(format!("invalid proxy URL {:?}: {}", value, e)))
    };

    Ok(Some(ProxyConfig {
        http_proxy: parse(&http_proxy)?,
        https_proxy: parse(&https_proxy)?,
    }))
}

/// コンテキストサブディレクトリの正規化（"." と "/" は無指定扱い）
fn clean_context_dir(context_dir: &str) -> String {
    let trimmed = context_dir.trim();
    if trimmed == "." || trimmed == "/" {
        String::new()
    } else {
        trimmed.trim_start_matches("./").to_string()
    }
}

/// デリゲートの構造化された失敗
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReason {
    pub reason: String,
    pub message: String,
}

/// アセンブリ成功時の結果
#[derive(Debug, Clone, Default)]
pub struct AssemblyResult {
    /// デリゲート側で計測されたステージ / ステップ
    pub stages: Vec<StageStep>,
}

/// ソースアセンブリ戦略エンジンの capability トレイト
#[allow(async_fn_in_trait)]
pub trait AssemblyStrategy {
    async fn assemble(&self, config: &AssemblyConfig) -> BuildResult<AssemblyResult>;
}

/// 外部ジェネレータが書き出すレポート
#[derive(Debug, Default, Deserialize)]
struct AssemblyReport {
    #[serde(default)]
    stages: Vec<StageStep>,
    #[serde(default)]
    failure: Option<FailureReason>,
}

/// 外部プロセスとしてアセンブリジェネレータを起動する本番実装
///
/// 設定を JSON の一時ファイルで渡し、stdout の JSON レポートを読む。
pub struct ProcessAssemblyStrategy {
    command: PathBuf,
}

impl Default for ProcessAssemblyStrategy {
    fn default() -> Self {
        Self::new(PathBuf::from("kiln-assemble"))
    }
}

impl ProcessAssemblyStrategy {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

impl AssemblyStrategy for ProcessAssemblyStrategy {
    async fn assemble(&self, config: &AssemblyConfig) -> BuildResult<AssemblyResult> {
        let config_file = tempfile::NamedTempFile::new()?;
        let payload = serde_json::to_vec(config)
            .map_err(|e| BuildError::InvalidConfig(format!("config not serializable: {}", e)))?;
        std::fs::write(config_file.path(), payload)?;

        tracing::info!(
            "Generating recipe with builder image {}",
            config.builder_image
        );
        let output = tokio::process::Command::new(&self.command)
            .arg("--config")
            .arg(config_file.path())
            .output()
            .await
            .map_err(|e| BuildError::Assembly {
                reason: "AssembleFailed".to_string(),
                message: format!("failed to run {}: {}", self.command.display(), e),
            })?;

        let report: AssemblyReport = match serde_json::from_slice(&output.stdout) {
            Ok(report) => report,
            Err(err) => {
                // レポートなしは許容するが、黙って捨てると計測が消えた理由が追えない
                tracing::debug!("assembly report not parseable: {}", err);
                AssemblyReport::default()
            }
        };

        if let Some(failure) = report.failure {
            return Err(BuildError::Assembly {
                reason: failure.reason,
                message: failure.message,
            });
        }
        if !output.status.success() {
            return Err(BuildError::Assembly {
                reason: "AssembleFailed".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(AssemblyResult {
            stages: report.stages,
        })
    }
}
