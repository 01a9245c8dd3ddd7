//! モデルティアマッピング
//!
//! # 責務
//!
//! - モデルティア（Heavy/Medium/Light）から各バックエンドの
//!   実際のモデル名へのマッピングを提供
//!
//! エンジンはモデル名を直接は扱わず、処理の性質に応じたティアだけを
//! 指定します（分類は Medium、生成は Heavy、タイトル生成などの
//! 補助処理は Light）。

use serde::{Deserialize, Serialize};

/// モデルのティア（Heavy/Medium/Light）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// 複雑な生成タスク用
    Heavy,
    /// 構造化出力を伴う分類タスク用
    Medium,
    /// 簡単な補助タスク用
    Light,
}

/// OpenAI 互換バックエンドのモデル名を解決
pub fn openai_model(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Heavy => "gpt-4o",
        ModelTier::Medium => "gpt-4o",
        ModelTier::Light => "gpt-4o-mini",
    }
}

/// Claude CLI バックエンドのモデル名を解決
pub fn claude_model(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Heavy => "claude-opus-4-1",
        ModelTier::Medium => "claude-sonnet-4-5",
        ModelTier::Light => "claude-haiku-4-5",
    }
}
