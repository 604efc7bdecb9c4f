//! ステージ / ステップの計測
//!
//! 外部から観測可能な各ステップ（pull、アセンブリ、ビルド、push）の
//! 開始・終了時刻を追記専用で記録する。順序は宣言順ではなく実際の
//! 実行順をそのまま反映する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ステージ名
pub mod stages {
    pub const PULL_IMAGES: &str = "PullImages";
    pub const ASSEMBLE: &str = "Assemble";
    pub const BUILD: &str = "Build";
    pub const PUSH_IMAGE: &str = "PushImage";
}

/// ステップ名
pub mod steps {
    pub const PULL_BASE_IMAGE: &str = "PullBaseImage";
    pub const PULL_INPUT_IMAGE: &str = "PullInputImage";
    pub const ENGINE_BUILD: &str = "EngineBuild";
    pub const PUSH_IMAGE: &str = "PushImage";
}

/// 1ステップ分の計測レコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStep {
    pub stage: String,
    pub step: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// 実行順に並んだステップ計測の列
#[derive(Debug, Clone, Default)]
pub struct StageTiming {
    records: Vec<StageStep>,
}

impl StageTiming {
    pub fn new() -> Self {
        Self::default()
    }

    /// ステップを記録する。end < start の場合は 0ms として扱う。
    pub fn record(&mut self, stage: &str, step: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        let duration_ms = (end - start).num_milliseconds().max(0);
        self.records.push(StageStep {
            stage: stage.to_string(),
            step: step.to_string(),
            started_at: start,
            duration_ms,
        });
    }

    /// 外部デリゲートが返したレコードを実行順のままマージ
    pub fn merge(&mut self, other: Vec<StageStep>) {
        self.records.extend(other);
    }

    pub fn records(&self) -> &[StageStep] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
