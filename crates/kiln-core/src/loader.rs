//! ビルドリクエスト / ソースメタデータの読み込み

use crate::error::{CoreError, CoreResult};
use crate::model::{BuildRequest, GitSourceInfo};
use std::path::Path;

/// JSON ファイルからビルドリクエストを読み込む
pub fn load_build_request(path: &Path) -> CoreResult<BuildRequest> {
    if !path.exists() {
        return Err(CoreError::RequestNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let request: BuildRequest = serde_json::from_str(&content)?;
    tracing::debug!(
        "Loaded build request {}/{} from {}",
        request.namespace,
        request.name,
        path.display()
    );
    Ok(request)
}

/// 前段のクローン処理が書き出した git メタデータを読み込む
///
/// ファイルが存在しない場合はメタデータなしとして扱う（エラーではない）。
pub fn load_source_info(path: &Path) -> CoreResult<Option<GitSourceInfo>> {
    if !path.exists() {
        tracing::debug!("No source info at {}", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let info: GitSourceInfo = serde_json::from_str(&content)?;
    Ok(Some(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_build_request_minimal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.json");
        fs::write(
            &path,
            r#"{
                "namespace": "demo",
                "name": "app-1",
                "source": { "git": { "uri": "https://example.com/app.git" } },
                "strategy": { "builder_image": "ghcr.io/kiln/builder:latest" }
            }"#,
        )
        .unwrap();

        let request = load_build_request(&path).unwrap();
        assert_eq!(request.namespace, "demo");
        assert_eq!(request.name, "app-1");
        assert_eq!(request.strategy.builder_image, "ghcr.io/kiln/builder:latest");
        assert!(request.output.to.is_none());
        assert!(!request.confidential);
    }

    #[test]
    fn test_load_build_request_missing_file() {
        let dir = tempdir().unwrap();
        let result = load_build_request(&dir.path().join("nope.json"));
        assert!(matches!(result, Err(CoreError::RequestNotFound(_))));
    }

    #[test]
    fn test_load_source_info_absent_is_none() {
        let dir = tempdir().unwrap();
        let info = load_source_info(&dir.path().join("source.json")).unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn test_load_source_info_reads_ref() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("source.json");
        fs::write(
            &path,
            r#"{ "location": "https://example.com/app.git", "ref": "main", "commit_id": "abc123" }"#,
        )
        .unwrap();

        let info = load_source_info(&path).unwrap().unwrap();
        assert_eq!(info.reference, "main");
        assert_eq!(info.commit_id, "abc123");
    }
}
