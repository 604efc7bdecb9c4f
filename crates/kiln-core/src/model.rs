//! ビルドリクエストのモデル
//!
//! 1回のオーケストレーション実行が消費する宣言的なビルドジョブの記述。
//! リクエストは呼び出し側が所有し、オーケストレータからは読み取り専用。

use serde::{Deserialize, Serialize};

/// 1つのコンテナイメージビルドジョブの宣言的な記述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// ビルドが属する名前空間（ビルドタグの導出に使用）
    pub namespace: String,
    /// ビルド名
    pub name: String,
    pub source: SourceSpec,
    pub strategy: StrategySpec,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub post_commit: PostCommitSpec,
    /// エンジンビルドへ渡すリソース制限（未指定ならエンジンのデフォルト）
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    /// 機密実行環境向けのセキュア再パッケージを行うかどうか
    #[serde(default)]
    pub confidential: bool,
}

/// ビルドソースの指定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(default)]
    pub git: Option<GitSource>,
    /// ソースツリー内のサブディレクトリ（"." と "/" は無指定扱い）
    #[serde(default)]
    pub context_dir: String,
    /// アセンブリ中に注入するシークレット（使用後は残さない）
    #[serde(default)]
    pub secrets: Vec<BuildVolumeSource>,
    /// アセンブリ中に注入する config map（イメージに残る）
    #[serde(default)]
    pub config_maps: Vec<BuildVolumeSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitSource {
    pub uri: String,
    /// 明示的にチェックアウトを要求した ref。
    /// チェックアウト済みツリーから得た commit ref より優先される。
    #[serde(default, rename = "ref")]
    pub reference: String,
}

/// アセンブリ中にマウントされるシークレット / config map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildVolumeSource {
    pub name: String,
    #[serde(default)]
    pub destination_dir: String,
}

/// ソースアセンブリ戦略の指定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategySpec {
    /// ビルダーイメージの参照
    pub builder_image: String,
    /// アセンブルスクリプトの取得元（未指定ならイメージラベルから導出）
    #[serde(default)]
    pub scripts_url: Option<String>,
    /// 前回の出力イメージを再利用するインクリメンタルビルド
    #[serde(default)]
    pub incremental: bool,
    /// ローカルに存在してもイメージを再取得する
    #[serde(default)]
    pub force_pull: bool,
    /// 戦略側の環境変数（HTTP_PROXY / HTTPS_PROXY もここから読む）
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// ビルド出力の指定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSpec {
    /// プッシュ先のイメージ参照。未指定なら「ビルドのみ、プッシュなし」
    #[serde(default)]
    pub to: Option<String>,
    /// 自動生成ラベルを上書きする呼び出し側指定のラベル（最後に適用）
    #[serde(default)]
    pub labels: Vec<ImageLabel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageLabel {
    pub name: String,
    pub value: String,
}

/// エンジンビルド後にレシピ末尾へ追記されるフック
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostCommitSpec {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub script: String,
}

impl PostCommitSpec {
    pub fn is_empty(&self) -> bool {
        self.command.is_empty() && self.args.is_empty() && self.script.is_empty()
    }
}

/// エンジンビルドへそのまま渡すリソース制限
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu_shares: Option<i64>,
    #[serde(default)]
    pub cpu_period: Option<i64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    #[serde(default)]
    pub memory: Option<i64>,
    #[serde(default)]
    pub memory_swap: Option<i64>,
    #[serde(default)]
    pub cgroup_parent: Option<String>,
}

/// 事前に抽出済みの git メタデータ
///
/// 抽出自体はオーケストレーションの範囲外。クローンを行った前段が
/// JSON で書き出したものを読み込むだけ。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitSourceInfo {
    #[serde(default)]
    pub location: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub committer_name: String,
    #[serde(default)]
    pub committer_email: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub message: String,
}
