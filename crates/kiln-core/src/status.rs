//! ビルドステータス
//!
//! オーケストレータがステータス遷移のたびに更新し、外部のステータス
//! シンクへフラッシュするレコード。シンクは同一実行に対して複数回
//! 呼ばれることを許容する（last write wins）。

use serde::{Deserialize, Serialize};

/// ビルドのフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum BuildPhase {
    Pending,
    Running,
    Complete,
    Failed,
}

/// ステータスの理由コード
pub mod reasons {
    pub const PULL_BUILDER_IMAGE_FAILED: &str = "PullBuilderImageFailed";
    pub const IMAGE_INSPECTION_FAILED: &str = "ImageInspectionFailed";
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    pub const GENERIC_BUILD_FAILED: &str = "GenericBuildFailed";
    pub const RECIPE_PROCESSING_FAILED: &str = "RecipeProcessingFailed";
    pub const SECURE_REPACKAGING_FAILED: &str = "SecureRepackagingFailed";
    pub const PUSH_IMAGE_TO_REGISTRY_FAILED: &str = "PushImageToRegistryFailed";
}

/// 人間向けの定型メッセージ
pub mod messages {
    pub const GENERIC_BUILD_FAILED: &str = "Generic Build failure - check logs for details.";
    pub const PUSH_IMAGE_TO_REGISTRY_FAILED: &str =
        "Failed to push the image to the registry - check logs for details.";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatus {
    pub phase: BuildPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 呼び出し側から見た出力イメージの識別子（push tag）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_image_reference: Option<String>,
    /// プッシュ成功時にレジストリが返したコンテンツダイジェスト
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<String>,
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self {
            phase: BuildPhase::Pending,
            reason: None,
            message: None,
            output_image_reference: None,
            output_digest: None,
        }
    }
}

impl BuildStatus {
    /// フェーズを Failed にして理由とメッセージを記録
    pub fn fail(&mut self, reason: &str, message: impl Into<String>) {
        self.phase = BuildPhase::Failed;
        self.reason = Some(reason.to_string());
        self.message = Some(message.into());
    }
}
