//! ビルドステータスの報告先
//!
//! オーケストレーターはフェーズ遷移のたびにステータスを流す。
//! 報告の失敗でビルドを失敗させてはならないので、どの実装も
//! エラーを握ってログに残すだけにする。

use kiln_core::status::BuildStatus;
use kiln_core::timing::StageStep;
use serde::Serialize;
use std::path::PathBuf;

/// ステータス送出の capability トレイト
#[allow(async_fn_in_trait)]
pub trait StatusReporter {
    async fn report(&self, status: &BuildStatus, stages: &[StageStep]);
}

/// tracing に流すだけの報告先
pub struct LogReporter;

impl StatusReporter for LogReporter {
    async fn report(&self, status: &BuildStatus, _stages: &[StageStep]) {
        tracing::info!(
            phase = ?status.phase,
            reason = status.reason.as_deref().unwrap_or(""),
            message = status.message.as_deref().unwrap_or(""),
            "build status updated"
        );
    }
}

#[derive(Serialize)]
struct StatusSnapshot<'a> {
    #[serde(flatten)]
    status: &'a BuildStatus,
    stages: &'a [StageStep],
}

/// ステータスを JSON ファイルに書き出す報告先。
/// 外側のコントローラーがこのファイルを監視して状態を取り込む。
pub struct FileStatusReporter {
    path: Option<PathBuf>,
}

impl FileStatusReporter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl StatusReporter for FileStatusReporter {
    async fn report(&self, status: &BuildStatus, stages: &[StageStep]) {
        LogReporter.report(status, stages).await;

        let Some(path) = &self.path else {
            return;
        };
        let snapshot = StatusSnapshot { status, stages };
        let payload = match serde_json::to_vec_pretty(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("failed to serialize build status: {}", err);
                return;
            }
        };
        if let Err(err) = tokio::fs::write(path, payload).await {
            tracing::warn!("failed to write build status to {}: {}", path.display(), err);
        }
    }
}
