//! レジストリへの push とアテステーション登録
//!
//! ビルドタグを push タグに付け替え、push 認証で送出する。
//! 機密ビルドでは digest 確定後にアテステーションサーバーへ
//! イメージを登録する。登録失敗はビルドを失敗させない。

use crate::auth::{AuthType, RegistryAuth};
use crate::engine::{ContainerEngine, push_auth_context};
use crate::error::{BuildError, BuildResult};
use crate::repackage::RepackageOutcome;
use crate::retry::RetryPolicy;
use base64::Engine;
use kiln_core::model::BuildRequest;
use serde::Serialize;

/// アテステーションサーバーの登録エンドポイント
pub const ATTESTATION_ENDPOINT: &str =
    "http://registration-attestation-server.attestation:8080/confidential/register-image";

/// microVM 起動パラメータの固定部分
const KERNEL_CMDLINE_BASE: &str = "KRUN_CFG=2:512 reboot=k panic=-1 panic_print=0 pci=off \
     nomodules console=hvc0 rw no-kvmapf init=/bin/sh \
     virtio_mmio.device=4K@0xd0000000:5 virtio_mmio.device=4K@0xd0001000:6 \
     virtio_mmio.device=4K@0xd0002000:7 virtio_mmio.device=4K@0xd0003000:8 \
     swiotlb=65536";

/// push 先タグの解決。出力先が未設定なら push しない。
///
/// push しない場合でもタグ自体は `namespace/name` で返す。
/// 後続のアセンブリ設定（インクリメンタルの取得元など）が参照するため。
pub fn resolve_push_tag(request: &BuildRequest) -> (String, bool) {
    match &request.output.to {
        Some(to) if !to.is_empty() => (to.clone(), true),
        _ => (format!("{}/{}", request.namespace, request.name), false),
    }
}

pub struct PushController<'a, E> {
    engine: &'a E,
    auth: &'a RegistryAuth,
    policy: &'a RetryPolicy,
}

impl<'a, E: ContainerEngine> PushController<'a, E> {
    pub fn new(engine: &'a E, auth: &'a RegistryAuth, policy: &'a RetryPolicy) -> Self {
        Self { engine, auth, policy }
    }

    /// ビルドタグを push タグに付け替えてレジストリへ送出する。
    /// 成功時はレジストリが返した digest（返さない実装もある）。
    pub async fn push(&self, build_tag: &str, push_tag: &str) -> BuildResult<Option<String>> {
        self.engine.tag(build_tag, push_tag).await?;

        let credentials = self.auth.credentials_for(push_tag, AuthType::Push);
        let auth_present = credentials.is_some();
        if auth_present {
            tracing::debug!("Using provided push secret for pushing {} image", push_tag);
        } else {
            tracing::debug!("No push secret provided");
        }

        tracing::info!("Pushing image {} ...", push_tag);
        let digest = self
            .policy
            .run("Push", || self.engine.push(push_tag, credentials.clone()))
            .await
            .map_err(|err| BuildError::PushFailed {
                image: push_tag.to_string(),
                auth_context: push_auth_context(push_tag, auth_present),
                message: err.to_string(),
            })?;

        tracing::info!("Push successful");
        Ok(digest)
    }
}

#[derive(Debug, Serialize)]
struct RegistrationPayload {
    sha: String,
    name: String,
    kernel_cmd_line: String,
}

/// 暗号化イメージの登録クライアント
pub struct AttestationClient {
    client: reqwest::Client,
    endpoint: String,
}

impl Default for AttestationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AttestationClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: ATTESTATION_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// push 済みイメージをアテステーションサーバーへ登録する。
    /// 登録の失敗はログに残すだけで、ビルドの成否には影響しない。
    pub async fn register_image(&self, digest: &str, push_tag: &str, outcome: &RepackageOutcome) {
        let payload = RegistrationPayload {
            sha: digest.to_string(),
            name: push_tag.replace(":latest", ""),
            kernel_cmd_line: encode_kernel_cmdline(outcome),
        };

        match self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::info!("registered image {} with attestation server", payload.name);
            }
            Ok(response) => {
                tracing::warn!(
                    "error registering image: attestation server returned {}",
                    response.status()
                );
            }
            Err(err) => {
                tracing::warn!("error registering image: {}", err);
            }
        }
    }
}

/// microVM 起動パラメータを組み立てて base64 で畳む。
/// シークレット、init、作業ディレクトリの後に抽出済み環境変数が続く。
fn encode_kernel_cmdline(outcome: &RepackageOutcome) -> String {
    let cmdline = format!(
        "{} KRUN_PASS={} KRUN_INIT=/usr/libexec/s2i/run KRUN_WORKDIR={} {}",
        KERNEL_CMDLINE_BASE, outcome.secret, outcome.workdir, outcome.env
    );
    base64::engine::general_purpose::STANDARD.encode(cmdline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineBuildRequest, ImageRecord};
    use bollard::auth::DockerCredentials;
    use kiln_core::model::OutputSpec;
    use std::sync::Mutex;

    fn request_with_output(to: Option<&str>) -> BuildRequest {
        BuildRequest {
            namespace: "demo".to_string(),
            name: "app".to_string(),
            source: Default::default(),
            strategy: Default::default(),
            output: OutputSpec {
                to: to.map(str::to_string),
                ..Default::default()
            },
            post_commit: Default::default(),
            resources: None,
            confidential: false,
        }
    }

    #[test]
    fn test_resolve_push_tag_uses_output_reference() {
        let request = request_with_output(Some("registry.local/demo/app:latest"));
        assert_eq!(
            resolve_push_tag(&request),
            ("registry.local/demo/app:latest".to_string(), true)
        );
    }

    #[test]
    fn test_resolve_push_tag_falls_back_without_push() {
        assert_eq!(
            resolve_push_tag(&request_with_output(None)),
            ("demo/app".to_string(), false)
        );
        assert_eq!(
            resolve_push_tag(&request_with_output(Some(""))),
            ("demo/app".to_string(), false)
        );
    }

    #[test]
    fn test_kernel_cmdline_carries_secret_workdir_and_env() {
        let outcome = RepackageOutcome {
            env: "HOME=\"/root\"".to_string(),
            workdir: "/workspace".to_string(),
            secret: "s3cret".to_string(),
        };
        let decoded = String::from_utf8(
            base64::engine::general_purpose::STANDARD
                .decode(encode_kernel_cmdline(&outcome))
                .unwrap(),
        )
        .unwrap();
        assert!(decoded.starts_with("KRUN_CFG=2:512"));
        assert!(decoded.contains("KRUN_PASS=s3cret"));
        assert!(decoded.contains("KRUN_INIT=/usr/libexec/s2i/run"));
        assert!(decoded.contains("KRUN_WORKDIR=/workspace"));
        assert!(decoded.ends_with("HOME=\"/root\""));
    }

    #[test]
    fn test_registration_payload_strips_latest_tag() {
        let payload = RegistrationPayload {
            sha: "sha256:abc".to_string(),
            name: "registry.local/demo/app:latest".replace(":latest", ""),
            kernel_cmd_line: String::new(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["name"], "registry.local/demo/app");
        assert_eq!(json["sha"], "sha256:abc");
    }

    struct PushEngine {
        push_ok: bool,
        tags: Mutex<Vec<(String, String)>>,
        pushes: Mutex<Vec<String>>,
    }

    impl ContainerEngine for PushEngine {
        async fn inspect(&self, _: &str) -> crate::error::BuildResult<Option<ImageRecord>> {
            Ok(None)
        }
        async fn pull(
            &self,
            _: &str,
            _: Option<DockerCredentials>,
        ) -> crate::error::BuildResult<()> {
            Ok(())
        }
        async fn tag(&self, source: &str, target: &str) -> crate::error::BuildResult<()> {
            self.tags
                .lock()
                .unwrap()
                .push((source.to_string(), target.to_string()));
            Ok(())
        }
        async fn push(
            &self,
            image: &str,
            _: Option<DockerCredentials>,
        ) -> crate::error::BuildResult<Option<String>> {
            self.pushes.lock().unwrap().push(image.to_string());
            if self.push_ok {
                Ok(Some("sha256:abc".to_string()))
            } else {
                Err(BuildError::PushFailed {
                    image: image.to_string(),
                    auth_context: String::new(),
                    message: "connection reset".to_string(),
                })
            }
        }
        async fn build(&self, _: &EngineBuildRequest) -> crate::error::BuildResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_tags_then_pushes_and_returns_digest() {
        let engine = PushEngine {
            push_ok: true,
            tags: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        };
        let auth = RegistryAuth::with_paths(None, None);
        let policy = RetryPolicy::no_retry();

        let digest = PushController::new(&engine, &auth, &policy)
            .push("demo/app:build123", "registry.local/demo/app:latest")
            .await
            .unwrap();

        assert_eq!(digest.as_deref(), Some("sha256:abc"));
        assert_eq!(
            engine.tags.lock().unwrap().as_slice(),
            [(
                "demo/app:build123".to_string(),
                "registry.local/demo/app:latest".to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_failure_reports_auth_context() {
        let engine = PushEngine {
            push_ok: false,
            tags: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        };
        let auth = RegistryAuth::with_paths(None, None);
        let policy = RetryPolicy::default();

        let err = PushController::new(&engine, &auth, &policy)
            .push("demo/app:build123", "registry.local/demo/app:latest")
            .await
            .unwrap_err();

        match err {
            BuildError::PushFailed { image, auth_context, .. } => {
                assert_eq!(image, "registry.local/demo/app:latest");
                assert_eq!(auth_context, "no push credentials provided");
            }
            other => panic!("unexpected error: {other}"),
        }
        // リトライ上限まで試行してから諦める
        assert_eq!(engine.pushes.lock().unwrap().len(), 3);
    }
}
