//! 生成されたレシピへの post-commit フック追記
//!
//! アセンブリデリゲートが生成したレシピ（イメージビルド手順の順序付き
//! リスト）をパースし、エンジンが読む前に post-commit フックを末尾へ
//! 追記して書き戻す。元の手順が先、追記分が最後。

use crate::error::{BuildError, BuildResult};
use kiln_core::model::PostCommitSpec;
use std::path::Path;

/// パース済みのレシピ。論理行（継続行を連結した命令）の列。
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    instructions: Vec<String>,
}

impl Recipe {
    /// レシピ本文をパースする。空行とコメントは読み飛ばし、
    /// 末尾 `\` の継続行は 1 命令に連結する。
    pub fn parse(content: &str) -> BuildResult<Self> {
        let mut instructions = Vec::new();
        let mut current = String::new();

        for line in content.lines() {
            let trimmed = line.trim_end();
            if current.is_empty() {
                let stripped = trimmed.trim_start();
                if stripped.is_empty() || stripped.starts_with('#') {
                    continue;
                }
            }
            if let Some(head) = trimmed.strip_suffix('\\') {
                current.push_str(head);
            } else {
                current.push_str(trimmed);
                instructions.push(std::mem::take(&mut current));
            }
        }

        if !current.is_empty() {
            return Err(BuildError::Recipe(
                "unterminated line continuation at end of recipe".to_string(),
            ));
        }
        if instructions.is_empty() {
            return Err(BuildError::Recipe("recipe contains no instructions".to_string()));
        }

        Ok(Self { instructions })
    }

    pub fn append(&mut self, instruction: String) {
        self.instructions.push(instruction);
    }

    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    pub fn render(&self) -> String {
        let mut out = self.instructions.join("\n");
        out.push('\n');
        out
    }
}

/// post-commit フックをレシピ命令に変換する
pub fn post_commit_instructions(spec: &PostCommitSpec) -> Vec<String> {
    if !spec.script.is_empty() {
        // シェル経由で実行。シングルクォートはエスケープする
        let escaped = spec.script.replace('\'', r"'\''");
        return vec![format!("RUN /bin/sh -ic '{}'", escaped)];
    }

    let argv: Vec<&String> = spec.command.iter().chain(spec.args.iter()).collect();
    if argv.is_empty() {
        return Vec::new();
    }
    let quoted: Vec<String> = argv
        .iter()
        .map(|a| format!("\"{}\"", a.replace('\\', r"\\").replace('"', "\\\"")))
        .collect();
    vec![format!("RUN [{}]", quoted.join(", "))]
}

/// レシピファイルをパースし、post-commit フックを追記して書き戻す
pub fn append_post_commit(path: &Path, spec: &PostCommitSpec) -> BuildResult<()> {
    if spec.is_empty() {
        return Ok(());
    }

    let content = std::fs::read_to_string(path)?;
    let mut recipe = Recipe::parse(&content)?;
    for instruction in post_commit_instructions(spec) {
        recipe.append(instruction);
    }

    let rendered = recipe.render();
    tracing::debug!("Rewriting recipe {} with post-commit hook", path.display());
    std::fs::write(path, rendered)?;
    Ok(())
}
