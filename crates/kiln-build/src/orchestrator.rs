//! ビルドオーケストレーター
//!
//! 1 回のビルドリクエストを、設定組み立て → ビルダーイメージ取得 →
//! アセンブリ → エンジンビルド →（機密なら）再パッケージ → push →
//! アテステーション登録の順で駆動する。失敗はどの段階でも
//! ステータスに理由コードを刻んでから伝播し、最終ステータスは
//! 成否にかかわらず必ず一度は報告される。

use crate::assembly::{AssemblyStrategy, ConfigAssembler, RECIPE_CONTEXT_DIR, RECIPE_FILE_NAME};
use crate::auth::{AuthType, RegistryAuth};
use crate::engine::{ContainerEngine, EngineBuildRequest};
use crate::error::{BuildError, BuildResult};
use crate::incremental::pull_incremental_image;
use crate::introspect::{DESTINATION_LABEL, ImageIntrospector, SCRIPTS_URL_LABEL};
use crate::push::{AttestationClient, PushController, resolve_push_tag};
use crate::recipe::append_post_commit;
use crate::repackage::{ProcessRunner, RepackageOutcome, SecureRepackager};
use crate::retry::RetryPolicy;
use crate::status::StatusReporter;
use chrono::Utc;
use kiln_core::model::{BuildRequest, GitSourceInfo};
use kiln_core::status::{BuildPhase, BuildStatus, messages, reasons};
use kiln_core::timing::{StageTiming, stages, steps};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

pub struct BuildOrchestrator<E, S, P, R> {
    engine: E,
    strategy: S,
    runner: P,
    reporter: R,
    auth: RegistryAuth,
    retry: RetryPolicy,
    attestation: AttestationClient,
    recipe_context_dir: PathBuf,
    repackage_context_dir: Option<PathBuf>,
    repackage_cooldown: Option<Duration>,
}

impl<E, S, P, R> BuildOrchestrator<E, S, P, R>
where
    E: ContainerEngine,
    S: AssemblyStrategy,
    P: ProcessRunner,
    R: StatusReporter,
{
    pub fn new(engine: E, strategy: S, runner: P, reporter: R) -> Self {
        Self {
            engine,
            strategy,
            runner,
            reporter,
            auth: RegistryAuth::from_env(),
            retry: RetryPolicy::default(),
            attestation: AttestationClient::new(),
            recipe_context_dir: PathBuf::from(RECIPE_CONTEXT_DIR),
            repackage_context_dir: None,
            repackage_cooldown: None,
        }
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attestation_client(mut self, attestation: AttestationClient) -> Self {
        self.attestation = attestation;
        self
    }

    pub fn with_recipe_context_dir(mut self, dir: PathBuf) -> Self {
        self.recipe_context_dir = dir;
        self
    }

    pub fn with_repackage_context_dir(mut self, dir: PathBuf) -> Self {
        self.repackage_context_dir = Some(dir);
        self
    }

    pub fn with_repackage_cooldown(mut self, cooldown: Duration) -> Self {
        self.repackage_cooldown = Some(cooldown);
        self
    }

    /// ビルドを最後まで駆動する。
    /// 最終ステータスは成功・失敗どちらでも必ず報告してから返る。
    pub async fn run(
        &self,
        request: &BuildRequest,
        source_info: Option<&GitSourceInfo>,
    ) -> BuildResult<BuildStatus> {
        let mut status = BuildStatus::default();
        let mut timing = StageTiming::new();

        let result = self
            .execute(request, source_info, &mut status, &mut timing)
            .await;
        self.reporter.report(&status, timing.records()).await;

        result?;
        Ok(status)
    }

    async fn execute(
        &self,
        request: &BuildRequest,
        source_info: Option<&GitSourceInfo>,
        status: &mut BuildStatus,
        timing: &mut StageTiming,
    ) -> BuildResult<()> {
        let (push_tag, push) = resolve_push_tag(request);
        status.phase = BuildPhase::Running;
        status.output_image_reference = Some(push_tag.clone());
        self.reporter.report(status, timing.records()).await;

        // 中間タグは実行ごとに一意。push 時に本来のタグへ付け替える
        let build_tag = format!(
            "{}/{}:{}",
            request.namespace,
            request.name,
            Uuid::new_v4().simple()
        );

        let mut config = match ConfigAssembler::new(request, source_info).assemble(&push_tag) {
            Ok(config) => config,
            Err(err) => {
                status.fail(reasons::INVALID_CONFIGURATION, err.to_string());
                return Err(err);
            }
        };
        config.as_recipe_file = self.recipe_context_dir.join(RECIPE_FILE_NAME);
        if let Some(proxy) = &config.proxy {
            tracing::info!(
                "Using HTTP proxy {:?} and HTTPS proxy {:?} for script download",
                proxy.http_proxy,
                proxy.https_proxy
            );
        }

        // リクエストは不変なので、ダウングレード可能な値はローカルへ
        let mut force_pull = request.strategy.force_pull;

        let introspector = ImageIntrospector::new(&self.engine);
        if force_pull || !introspector.is_present(&config.builder_image).await {
            tracing::info!("Pulling builder image {}", config.builder_image);
            let credentials = self
                .auth
                .credentials_for(&config.builder_image, AuthType::Pull);
            let start = Utc::now();
            let result = self
                .retry
                .run("Pull", || {
                    self.engine.pull(&config.builder_image, credentials.clone())
                })
                .await;
            timing.record(stages::PULL_IMAGES, steps::PULL_BASE_IMAGE, start, Utc::now());
            if let Err(err) = result {
                status.fail(reasons::PULL_BUILDER_IMAGE_FAILED, err.to_string());
                return Err(err);
            }
        }

        pull_incremental_image(
            &mut config,
            &mut force_pull,
            &self.engine,
            &self.auth,
            &self.retry,
            timing,
        )
        .await;

        match self.introspect_builder(&mut config).await {
            Ok(()) => {}
            Err(err) => {
                status.fail(reasons::IMAGE_INSPECTION_FAILED, err.to_string());
                return Err(err);
            }
        }

        if let Err(err) = config.validate() {
            status.fail(reasons::INVALID_CONFIGURATION, err.to_string());
            return Err(err);
        }

        match self.strategy.assemble(&config).await {
            Ok(result) => timing.merge(result.stages),
            Err(err) => {
                // デリゲートが理由を構造化して返した場合はそのまま刻む
                if let BuildError::Assembly { reason, message } = &err {
                    status.fail(reason, message.clone());
                } else {
                    status.fail(reasons::GENERIC_BUILD_FAILED, messages::GENERIC_BUILD_FAILED);
                }
                return Err(err);
            }
        }

        let recipe_path = self.recipe_context_dir.join(RECIPE_FILE_NAME);
        if recipe_path.exists()
            && let Err(err) = append_post_commit(&recipe_path, &request.post_commit)
        {
            status.fail(reasons::RECIPE_PROCESSING_FAILED, err.to_string());
            return Err(err);
        }

        let engine_request = EngineBuildRequest {
            tag: build_tag.clone(),
            context_dir: self.recipe_context_dir.clone(),
            recipe_file: RECIPE_FILE_NAME.to_string(),
            pull: force_pull,
            no_cache: false,
            limits: request.resources.clone(),
            pull_credentials: self
                .auth
                .credentials_for(&config.builder_image, AuthType::Pull),
        };
        tracing::info!("Building image {}", build_tag);
        let start = Utc::now();
        let build_result = self.engine.build(&engine_request).await;
        timing.record(stages::BUILD, steps::ENGINE_BUILD, start, Utc::now());
        if let Err(err) = build_result {
            tracing::error!("Engine build failed: {}", err);
            status.fail(reasons::GENERIC_BUILD_FAILED, messages::GENERIC_BUILD_FAILED);
            return Err(err);
        }

        let mut repackaged: Option<RepackageOutcome> = None;
        if request.confidential {
            let mut repackager = SecureRepackager::new(&self.engine, &self.runner);
            if let Some(cooldown) = self.repackage_cooldown {
                repackager = repackager.with_cooldown(cooldown);
            }
            if let Some(dir) = &self.repackage_context_dir {
                repackager = repackager.with_context_dir(dir.clone());
            }
            let pull_credentials = self
                .auth
                .credentials_for(&config.builder_image, AuthType::Pull);
            match repackager
                .repackage(
                    &build_tag,
                    force_pull,
                    request.resources.as_ref(),
                    pull_credentials,
                )
                .await
            {
                Ok(outcome) => repackaged = Some(outcome),
                Err(err) => {
                    status.fail(reasons::SECURE_REPACKAGING_FAILED, err.to_string());
                    return Err(err);
                }
            }
        }

        if push {
            let controller = PushController::new(&self.engine, &self.auth, &self.retry);
            let start = Utc::now();
            let push_result = controller.push(&build_tag, &push_tag).await;
            timing.record(stages::PUSH_IMAGE, steps::PUSH_IMAGE, start, Utc::now());

            let digest = match push_result {
                Ok(digest) => digest,
                Err(err) => {
                    status.fail(
                        reasons::PUSH_IMAGE_TO_REGISTRY_FAILED,
                        messages::PUSH_IMAGE_TO_REGISTRY_FAILED,
                    );
                    return Err(err);
                }
            };

            if let Some(digest) = digest {
                tracing::info!("digest: {}", digest);
                if let Some(outcome) = &repackaged {
                    self.attestation
                        .register_image(&digest, &push_tag, outcome)
                        .await;
                }
                status.output_digest = Some(digest);
                self.reporter.report(status, timing.records()).await;
            }
        }

        status.phase = BuildPhase::Complete;
        Ok(())
    }

    /// ビルダーイメージのラベルからアセンブリ既定値を補完する
    async fn introspect_builder(
        &self,
        config: &mut crate::assembly::AssemblyConfig,
    ) -> BuildResult<()> {
        let introspector = ImageIntrospector::new(&self.engine);

        let user = introspector.assemble_user(&config.builder_image).await?;
        if !user.is_empty() {
            config.assemble_user = Some(user);
        }

        let labels = introspector.labels(&config.builder_image).await?;
        if let Some(destination) = labels.get(DESTINATION_LABEL) {
            config.destination = Some(destination.clone());
        }
        // リクエストで明示された URL があればラベル由来は見ない
        if config.scripts_url.is_none()
            && let Some(scripts_url) = labels.get(SCRIPTS_URL_LABEL)
        {
            config.image_scripts_url = Some(scripts_url.clone());
        }
        Ok(())
    }
}
