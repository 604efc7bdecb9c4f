//! ビルダーイメージの introspection
//!
//! pull が必要かの判定と、イメージラベルからのアセンブリ既定値の導出。
//! 存在チェックは真偽値であってエラーではない（pull 前の不在が通常系）。
//! ラベル / ユーザー取得時の inspect 失敗は致命的で、リトライしない。

use crate::engine::ContainerEngine;
use crate::error::{BuildError, BuildResult};
use std::collections::HashMap;

/// アセンブルユーザーを上書きするラベル
pub const ASSEMBLE_USER_LABEL: &str = "io.kiln.assemble-user";
/// アセンブリ先ディレクトリを示すラベル
pub const DESTINATION_LABEL: &str = "io.kiln.destination";
/// アセンブルスクリプトの取得元を示すラベル
pub const SCRIPTS_URL_LABEL: &str = "io.kiln.scripts-url";

pub struct ImageIntrospector<'a, E: ContainerEngine> {
    engine: &'a E,
}

impl<'a, E: ContainerEngine> ImageIntrospector<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// inspect が成功してレコードが返ったときのみ true
    pub async fn is_present(&self, image: &str) -> bool {
        matches!(self.engine.inspect(image).await, Ok(Some(_)))
    }

    pub async fn labels(&self, image: &str) -> BuildResult<HashMap<String, String>> {
        let record = self.inspect_required(image).await?;
        Ok(record.labels)
    }

    /// アセンブルユーザーの解決。
    /// 既定はイメージの実行ユーザー、ラベルがあればそちらを優先。
    /// `user:group` 形式はユーザー部分のみ残す。
    pub async fn assemble_user(&self, image: &str) -> BuildResult<String> {
        let record = self.inspect_required(image).await?;
        let mut user = record.user.unwrap_or_default();
        if let Some(label_user) = record.labels.get(ASSEMBLE_USER_LABEL) {
            user = label_user.clone();
        }
        Ok(extract_user(&user))
    }

    async fn inspect_required(&self, image: &str) -> BuildResult<crate::engine::ImageRecord> {
        match self.engine.inspect(image).await? {
            Some(record) => Ok(record),
            None => Err(BuildError::ImageInspect {
                image: image.to_string(),
                message: "image not found".to_string(),
            }),
        }
    }
}

/// `user:group` 形式からユーザー部分を取り出す
pub fn extract_user(user_spec: &str) -> String {
    match user_spec.split_once(':') {
        Some((user, _group)) => user.trim().to_string(),
        None => user_spec.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineBuildRequest, ImageRecord};
    use bollard::auth::DockerCredentials;
    use std::sync::Mutex;

    /// 固定応答を返すテスト用エンジン
    struct StubEngine {
        record: Mutex<Option<BuildResult<Option<ImageRecord>>>>,
    }

    impl StubEngine {
        fn with_record(record: ImageRecord) -> Self {
            Self {
                record: Mutex::new(Some(Ok(Some(record)))),
            }
        }

        fn absent() -> Self {
            Self {
                record: Mutex::new(Some(Ok(None))),
            }
        }

        fn failing() -> Self {
            Self {
                record: Mutex::new(Some(Err(BuildError::ImageInspect {
                    image: "x".to_string(),
                    message: "daemon unreachable".to_string(),
                }))),
            }
        }
    }

    impl ContainerEngine for StubEngine {
        async fn inspect(&self, _image: &str) -> BuildResult<Option<ImageRecord>> {
            self.record
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(None))
        }
        async fn pull(&self, _: &str, _: Option<DockerCredentials>) -> BuildResult<()> {
            Ok(())
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

    #[test]
    fn test_extract_user_keeps_user_component() {
        assert_eq!(extract_user("1001:1001"), "1001");
        assert_eq!(extract_user("builder : root"), "builder");
        assert_eq!(extract_user(" builder "), "builder");
        assert_eq!(extract_user(""), "");
    }

    #[tokio::test]
    async fn test_is_present_treats_inspect_error_as_absent() {
        let engine = StubEngine::failing();
        let introspector = ImageIntrospector::new(&engine);
        assert!(!introspector.is_present("ghcr.io/kiln/builder").await);

        let engine = StubEngine::absent();
        let introspector = ImageIntrospector::new(&engine);
        assert!(!introspector.is_present("ghcr.io/kiln/builder").await);
    }

    #[tokio::test]
    async fn test_assemble_user_label_overrides_image_user() {
        let mut record = ImageRecord {
            user: Some("1001".to_string()),
            ..Default::default()
        };
        record
            .labels
            .insert(ASSEMBLE_USER_LABEL.to_string(), "builder:builder".to_string());

        let engine = StubEngine::with_record(record);
        let introspector = ImageIntrospector::new(&engine);
        let user = introspector.assemble_user("ghcr.io/kiln/builder").await.unwrap();
        assert_eq!(user, "builder");
    }

    #[tokio::test]
    async fn test_assemble_user_defaults_to_image_user() {
        let record = ImageRecord {
            user: Some("1001:0".to_string()),
            ..Default::default()
        };
        let engine = StubEngine::with_record(record);
        let introspector = ImageIntrospector::new(&engine);
        let user = introspector.assemble_user("ghcr.io/kiln/builder").await.unwrap();
        assert_eq!(user, "1001");
    }

    #[tokio::test]
    async fn test_labels_propagate_inspect_failure() {
        let engine = StubEngine::failing();
        let introspector = ImageIntrospector::new(&engine);
        let result = introspector.labels("ghcr.io/kiln/builder").await;
        assert!(matches!(result, Err(BuildError::ImageInspect { .. })));
    }
}
