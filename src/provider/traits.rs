//! 補完サービスの共通インターフェース定義
//!
//! # 責務
//!
//! - 補完サービスの共通トレイト [`CompletionClient`] を定義
//! - バックエンド非依存のレスポンス型 [`CompletionResponse`] を提供
//! - トークン使用量 [`TokenUsage`] の型を定義
//!
//! # 使用例
//!
//! ```rust,no_run
//! use kaiwa_flow::provider::{CompletionClient, ModelTier};
//!
//! async fn example(client: Box<dyn CompletionClient>) {
//!     let response = client.generate(
//!         "You are a helpful assistant.",
//!         "Hello!",
//!         ModelTier::Medium,
//!     ).await.unwrap();
//!
//!     println!("Response: {}", response.content);
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::model_tier::ModelTier;
use crate::error::ProviderError;

/// 補完サービスの共通インターフェース
///
/// このトレイトを実装することで、任意の補完サービスを
/// エンジンに統合できます。
///
/// # 実装要件
///
/// - `Send + Sync`: マルチスレッド環境で安全に使用可能
/// - 呼び出し間に状態を持たないこと（文脈はすべて引数で渡される）
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// プロンプトを実行し、レスポンスを取得する
    ///
    /// # 引数
    ///
    /// - `system_prompt`: システムプロンプト（役割・制約・出力形式の定義）
    /// - `user_input`: ユーザー入力（会話履歴を含む場合もある）
    /// - `tier`: モデルティア（Heavy/Medium/Light）
    ///
    /// # 戻り値
    ///
    /// - `Ok(CompletionResponse)`: 成功時、生成されたテキスト
    /// - `Err(ProviderError)`: 失敗時、エラー詳細
    async fn generate(
        &self,
        system_prompt: &str,
        user_input: &str,
        tier: ModelTier,
    ) -> Result<CompletionResponse, ProviderError>;

    /// ストリーミング版の実行
    ///
    /// 増分テキストを `chunks` チャネルへ送出しながら生成し、
    /// 最終的な完全なレスポンスを返します。
    ///
    /// 既定実装はストリーミング非対応バックエンド向けのフォールバックで、
    /// 全文を 1 チャンクとして送出します。受信側が途中で閉じても
    /// 生成自体は継続されます（キャンセルによる状態の巻き戻しは行わない）。
    async fn generate_streaming(
        &self,
        system_prompt: &str,
        user_input: &str,
        tier: ModelTier,
        chunks: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.generate(system_prompt, user_input, tier).await?;
        // 受信側が既に閉じていても無視する
        let _ = chunks.send(response.content.clone()).await;
        Ok(response)
    }
}

/// 補完サービスからのレスポンス
///
/// バックエンド固有のレスポンス形式を共通の型に変換したもの。
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// 生成されたテキスト
    pub content: String,

    /// トークン使用量
    pub token_usage: TokenUsage,

    /// 使用されたモデル名
    pub model: String,
}

/// トークン使用量
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TokenUsage {
    /// 入力トークン数（プロンプト）
    pub input_tokens: u32,

    /// 出力トークン数（生成テキスト）
    pub output_tokens: u32,
}

impl TokenUsage {
    /// 総トークン数を計算
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 250,
        };
        assert_eq!(usage.total(), 350);
    }

    /// 既定のストリーミング実装は全文を 1 チャンクで送出する
    #[tokio::test]
    async fn test_default_streaming_falls_back_to_single_chunk() {
        struct Fixed;

        #[async_trait::async_trait]
        impl CompletionClient for Fixed {
            async fn generate(
                &self,
                _system_prompt: &str,
                _user_input: &str,
                _tier: ModelTier,
            ) -> Result<CompletionResponse, ProviderError> {
                Ok(CompletionResponse {
                    content: "hello world".to_string(),
                    token_usage: TokenUsage::default(),
                    model: "fixed".to_string(),
                })
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let response = Fixed
            .generate_streaming("sys", "input", ModelTier::Light, tx)
            .await
            .unwrap();
        assert_eq!(response.content, "hello world");
        assert_eq!(rx.recv().await.as_deref(), Some("hello world"));
        assert!(rx.recv().await.is_none());
    }
}
