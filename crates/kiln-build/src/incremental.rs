//! インクリメンタルビルドのフォールバック
//!
//! 前回の出力イメージを取得できればアーティファクトを再利用し、
//! 取得できなければ通常のフルビルドへ静かにダウングレードする。
//! ここでの pull 失敗だけは回復可能な唯一のエラークラス。

use crate::assembly::AssemblyConfig;
use crate::auth::{AuthType, RegistryAuth};
use crate::engine::ContainerEngine;
use crate::introspect::ImageIntrospector;
use crate::retry::RetryPolicy;
use chrono::Utc;
use kiln_core::timing::{StageTiming, stages, steps};

/// 前回の出力イメージの pull を試みる。
///
/// 前回の出力は push 認証で作られているため、検索には push 側の
/// 認証セットを使う。成功したら `force_pull` を落とし、後続の pull
/// 経路が pull 認証で同じイメージを取り直して失敗するのを防ぐ。
/// 失敗は致命的ではなく、設定を非インクリメンタルに落として続行する。
pub async fn pull_incremental_image<E: ContainerEngine>(
    config: &mut AssemblyConfig,
    force_pull: &mut bool,
    engine: &E,
    auth: &RegistryAuth,
    policy: &RetryPolicy,
    timing: &mut StageTiming,
) {
    if !config.incremental {
        return;
    }
    let Some(from_tag) = config.incremental_from_tag.clone() else {
        return;
    };

    let introspector = ImageIntrospector::new(engine);
    if !*force_pull && introspector.is_present(&from_tag).await {
        return;
    }

    let credentials = auth.credentials_for(&from_tag, AuthType::Push);
    let start = Utc::now();
    let result = policy
        .run("Pull", || engine.pull(&from_tag, credentials.clone()))
        .await;
    timing.record(stages::PULL_IMAGES, steps::PULL_INPUT_IMAGE, start, Utc::now());

    match result {
        Ok(()) => {
            *force_pull = false;
        }
        Err(err) => {
            // 前回の出力がまだ存在しないだけかもしれない。通常ビルドへ。
            tracing::debug!(
                "Failed to pull incremental image {} - executing a full build instead",
                from_tag
            );
            tracing::trace!("Incremental image pull failure: {}", err);
            config.incremental = false;
            config.incremental_from_tag = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineBuildRequest, ImageRecord};
    use crate::error::{BuildError, BuildResult};
    use bollard::auth::DockerCredentials;
    use kiln_core::model::{BuildRequest, SourceSpec, StrategySpec};
    use std::sync::Mutex;

    struct PullEngine {
        present: bool,
        pull_ok: bool,
        pulls: Mutex<Vec<String>>,
    }

    impl ContainerEngine for PullEngine {
        async fn inspect(&self, _image: &str) -> BuildResult<Option<ImageRecord>> {
            Ok(self.present.then(ImageRecord::default))
        }
        async fn pull(&self, image: &str, _: Option<DockerCredentials>) -> BuildResult<()> {
            self.pulls.lock().unwrap().push(image.to_string());
            if self.pull_ok {
                Ok(())
            } else {
                Err(BuildError::PullFailed {
                    image: image.to_string(),
                    message: "manifest unknown".to_string(),
                })
            }
        }
        async fn tag(&self, _: &str, _: &str) -> BuildResult<()> {
            Ok(())
        }
        async fn push(&self, _: &str, _: Option<DockerCredentials>) -> BuildResult<Option<String>> {
            Ok(None)
        }
        async fn build(&self, _: &EngineBuildRequest) -> BuildResult<()> {
            Ok(())
        }
    }

    fn incremental_config() -> AssemblyConfig {
        let request = BuildRequest {
            namespace: "demo".to_string(),
            name: "app".to_string(),
            source: SourceSpec::default(),
            strategy: StrategySpec {
                builder_image: "ghcr.io/kiln/builder".to_string(),
                incremental: true,
                ..Default::default()
            },
            output: Default::default(),
            post_commit: Default::default(),
            resources: None,
            confidential: false,
        };
        crate::assembly::ConfigAssembler::new(&request, None)
            .assemble("registry.local/demo/app:latest")
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_failure_downgrades_to_full_build() {
        let engine = PullEngine {
            present: false,
            pull_ok: false,
            pulls: Mutex::new(Vec::new()),
        };
        let mut config = incremental_config();
        let mut force_pull = false;
        let mut timing = StageTiming::new();
        let auth = RegistryAuth::with_paths(None, None);

        pull_incremental_image(
            &mut config,
            &mut force_pull,
            &engine,
            &auth,
            &RetryPolicy::no_retry(),
            &mut timing,
        )
        .await;

        assert!(!config.incremental);
        assert!(config.incremental_from_tag.is_none());
        // タイミングは失敗した pull も記録する
        assert_eq!(timing.records()[0].step, steps::PULL_INPUT_IMAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_success_clears_force_pull() {
        let engine = PullEngine {
            present: false,
            pull_ok: true,
            pulls: Mutex::new(Vec::new()),
        };
        let mut config = incremental_config();
        let mut force_pull = true;
        let mut timing = StageTiming::new();
        let auth = RegistryAuth::with_paths(None, None);

        pull_incremental_image(
            &mut config,
            &mut force_pull,
            &engine,
            &auth,
            &RetryPolicy::no_retry(),
            &mut timing,
        )
        .await;

        assert!(config.incremental);
        assert!(!force_pull);
        assert_eq!(
            engine.pulls.lock().unwrap().as_slice(),
            ["registry.local/demo/app:latest"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_present_image_skips_pull_without_force() {
        let engine = PullEngine {
            present: true,
            pull_ok: true,
            pulls: Mutex::new(Vec::new()),
        };
        let mut config = incremental_config();
        let mut force_pull = false;
        let mut timing = StageTiming::new();
        let auth = RegistryAuth::with_paths(None, None);

        pull_incremental_image(
            &mut config,
            &mut force_pull,
            &engine,
            &auth,
            &RetryPolicy::no_retry(),
            &mut timing,
        )
        .await;

        assert!(config.incremental);
        assert!(engine.pulls.lock().unwrap().is_empty());
        assert!(timing.is_empty());
    }
}
