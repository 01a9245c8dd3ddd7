//! OpenAI 互換 HTTP API クライアント
//!
//! # 責務
//!
//! - OpenAI 互換の chat completions エンドポイントとの通信を担当
//! - [`CompletionClient`] トレイトを実装し、統一インターフェースを提供
//!
//! # 認証
//!
//! API キーは環境変数 `OPENAI_API_KEY` から読み込みます。
//! 互換サーバー（セルフホストのゲートウェイ等）を使う場合は
//! [`HttpCompletionClient::with_base_url`] でエンドポイントを差し替えます。

use async_trait::async_trait;
use serde::Deserialize;

use super::model_tier::{ModelTier, openai_model};
use super::traits::{CompletionClient, CompletionResponse, TokenUsage};
use crate::error::ProviderError;

/// 既定のエンドポイント
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// API キーの環境変数名
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// OpenAI 互換 HTTP API クライアント
pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCompletionClient {
    /// 環境変数から API キーを読み込んでクライアントを生成
    ///
    /// # エラー
    ///
    /// - [`ProviderError::Authentication`] - `OPENAI_API_KEY` が未設定
    pub fn openai() -> Result<Self, ProviderError> {
        let api_key = std::env::var(API_KEY_ENV).map_err(|_| {
            ProviderError::Authentication(format!("環境変数 {API_KEY_ENV} が設定されていません"))
        })?;
        Ok(Self::from_parts(DEFAULT_BASE_URL, api_key))
    }

    /// エンドポイントと API キーを指定してクライアントを生成
    pub fn from_parts(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// エンドポイントを差し替え（互換サーバー用）
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// chat completions レスポンス（必要なフィールドのみ）
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_input: &str,
        tier: ModelTier,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = openai_model(tier);
        let body = serde_json::json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_input },
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimitExceeded);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Authentication(detail));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {status}: {detail}"
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("JSON パースに失敗: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::InvalidResponse("choices が空のレスポンス".to_string())
            })?;

        let token_usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            token_usage,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
        })
    }
}
