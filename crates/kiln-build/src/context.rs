//! レシピコンテキストのアーカイブ
//!
//! アセンブリデリゲートが生成したコンテキストディレクトリを tar.gz に
//! 固めてエンジンへ送る。レシピファイルはディレクトリ内に含まれている
//! 前提なので個別の注入はしない。

use crate::error::{BuildError, BuildResult};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::Path;
use tar::Builder;

/// コンテキストディレクトリを tar.gz アーカイブとして作成
pub fn archive_context(context_dir: &Path) -> BuildResult<Vec<u8>> {
    if !context_dir.is_dir() {
        return Err(BuildError::EngineBuild(format!(
            "recipe context is not a directory: {}",
            context_dir.display()
        )));
    }

    tracing::debug!("Creating build context from: {}", context_dir.display());

    let mut archive_data = Vec::new();
    {
        let encoder = GzEncoder::new(&mut archive_data, Compression::default());
        let mut tar = Builder::new(encoder);
        tar.append_dir_all(".", context_dir).map_err(BuildError::Io)?;
        tar.finish().map_err(BuildError::Io)?;
    }

    tracing::debug!("Build context created: {} bytes", archive_data.len());
    Ok(archive_data)
}
