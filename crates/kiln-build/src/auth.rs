//! レジストリ認証処理
//!
//! Docker config.json から認証情報を取得し、bollard の DockerCredentials
//! に変換する。pull 用と push 用で別々の config を検索する。前回の出力
//! イメージは push 認証で作られているため、インクリメンタル pull は
//! push 側の認証セットを使う必要がある。

use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// pull 用 config.json のパスを指す環境変数
pub const PULL_DOCKERCFG_PATH: &str = "PULL_DOCKERCFG_PATH";
/// push 用 config.json のパスを指す環境変数
pub const PUSH_DOCKERCFG_PATH: &str = "PUSH_DOCKERCFG_PATH";

/// 認証情報をどちらのセットから探すか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Pull,
    Push,
}

/// Docker config.json の構造
#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// 認証エントリ
#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
}

/// pull / push それぞれの認証セットを管理
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pull_config_path: Option<PathBuf>,
    push_config_path: Option<PathBuf>,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RegistryAuth {
    /// 環境変数から検索パスを組み立てる
    pub fn from_env() -> Self {
        Self {
            pull_config_path: std::env::var(PULL_DOCKERCFG_PATH).ok().map(PathBuf::from),
            push_config_path: std::env::var(PUSH_DOCKERCFG_PATH).ok().map(PathBuf::from),
        }
    }

    /// 明示的なパス指定（テスト用）
    pub fn with_paths(pull: Option<PathBuf>, push: Option<PathBuf>) -> Self {
        Self {
            pull_config_path: pull,
            push_config_path: push,
        }
    }

    /// イメージ名に対応するレジストリの認証情報を解決する。
    /// 見つからない・読めないは認証なし（None）として扱い、エラーにしない。
    pub fn credentials_for(&self, image: &str, auth_type: AuthType) -> Option<DockerCredentials> {
        let registry = extract_registry(image);

        for path in self.search_paths(auth_type) {
            if !path.exists() {
                continue;
            }
            match load_docker_config(&path) {
                Ok(config) => {
                    if let Some(entry) = config.auths.get(&registry)
                        && let Some(auth_b64) = &entry.auth
                        && let Some(creds) = decode_auth(auth_b64, &registry)
                    {
                        tracing::debug!(
                            "Found {:?} credentials for {} in {}",
                            auth_type,
                            registry,
                            path.display()
                        );
                        return Some(creds);
                    }
                }
                Err(message) => {
                    tracing::debug!("Skipping {}: {}", path.display(), message);
                }
            }
        }

        tracing::debug!("No {:?} credentials found for {}", auth_type, registry);
        None
    }

    fn search_paths(&self, auth_type: AuthType) -> Vec<PathBuf> {
        let typed = match auth_type {
            AuthType::Pull => self.pull_config_path.clone(),
            AuthType::Push => self.push_config_path.clone(),
        };
        let default = dirs::home_dir().map(|h| h.join(".docker").join("config.json"));
        typed.into_iter().chain(default).collect()
    }
}

/// イメージ名からレジストリを抽出
///
/// # Examples
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn extract_registry(image: &str) -> String {
    let parts: Vec<&str> = image.split('/').collect();

    if parts.len() >= 2 {
        let first = parts[0];
        // レジストリは `.` か `:` を含む（ghcr.io, localhost:5000）
        if first.contains('.') || first.contains(':') {
            return first.to_string();
        }
    }

    "docker.io".to_string()
}

fn load_docker_config(path: &std::path::Path) -> Result<DockerConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read config.json: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed to parse config.json: {}", e))
}

fn decode_auth(auth_b64: &str, registry: &str) -> Option<DockerCredentials> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(auth_b64).ok()?;
    let auth_str = String::from_utf8(decoded).ok()?;
    let (username, password) = auth_str.split_once(':')?;
    Some(DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    })
}
