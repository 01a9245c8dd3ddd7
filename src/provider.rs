//! 補完サービス（LLMプロバイダー）抽象化レイヤー
//!
//! # 責務
//!
//! - 複数の補完サービス（OpenAI 互換 HTTP API、Claude CLI）を統一的に
//!   扱うインターフェースを提供
//! - バックエンドの種類に応じた適切なクライアントを生成するファクトリー機能
//! - モデルティア（Heavy/Medium/Light）から実際のモデル名へのマッピング
//!
//! # 設計
//!
//! 補完サービスは呼び出し間に記憶を持たない単発の呼び出し/応答
//! プリミティブです。必要な文脈はすべてエンジン側が明示的に渡します。
//! ストリーミング版は `tokio::sync::mpsc` チャネルに増分テキストを
//! 送出します。
//!
//! # モジュール構成
//!
//! - [`traits`] - 共通インターフェース（[`CompletionClient`] トレイト等）
//! - [`model_tier`] - モデルティアマッピング
//! - [`http`] - OpenAI 互換 HTTP API クライアント
//! - [`cli`] - Claude CLI クライアント

pub mod cli;
pub mod http;
pub mod model_tier;
pub mod traits;

// 公開APIの再エクスポート
pub use model_tier::ModelTier;
pub use traits::{CompletionClient, CompletionResponse, TokenUsage};

use crate::error::ProviderError;

/// 補完サービスのバックエンド種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// OpenAI 互換 HTTP API（環境変数 `OPENAI_API_KEY` を使用）
    OpenAi,
    /// Claude CLI（`claude` コマンド）
    Claude,
}

/// 補完クライアントを生成するファクトリー関数
///
/// # 引数
///
/// - `kind`: バックエンドの種別
///
/// # 戻り値
///
/// - `Ok(Box<dyn CompletionClient>)`: 成功時、補完クライアント
/// - `Err(ProviderError::Authentication)`: HTTP バックエンドで
///   API キーが未設定の場合
pub fn create_client(kind: ProviderKind) -> Result<Box<dyn CompletionClient>, ProviderError> {
    match kind {
        ProviderKind::OpenAi => Ok(Box::new(http::HttpCompletionClient::openai()?)),
        ProviderKind::Claude => Ok(Box::new(cli::ClaudeCliClient::new())),
    }
}
