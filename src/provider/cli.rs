//! Claude CLI クライアント
//!
//! # 責務
//!
//! - Claude CLI (`claude` コマンド) との通信を担当
//! - [`CompletionClient`] トレイトを実装し、統一インターフェースを提供
//! - CLI 固有の JSON 出力形式と共通型の変換
//!
//! # CLIツール
//!
//! - **コマンド**: `claude`
//! - **インストール**: `npm install -g @anthropic-ai/claude-code`
//! - **認証方法**:
//!   1. 環境変数 `ANTHROPIC_API_KEY` を設定
//!   2. `claude` を起動して `/login` コマンドを実行
//!
//! API キーの管理はCLIツールに委譲し、コード内では扱いません。

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::model_tier::{ModelTier, claude_model};
use super::traits::{CompletionClient, CompletionResponse, TokenUsage};
use crate::error::ProviderError;

/// デフォルトのCLIコマンド名
const DEFAULT_COMMAND: &str = "claude";

/// NPMパッケージ名（エラーメッセージ用）
const NPM_PACKAGE: &str = "@anthropic-ai/claude-code";

/// Claude CLI クライアント
///
/// `claude` コマンドを呼び出して補完を実行します。
/// 認証は環境変数またはCLIツールの事前ログインに依存します。
pub struct ClaudeCliClient {
    /// 使用するCLIコマンド名（通常は "claude"）
    command: String,
}

impl ClaudeCliClient {
    /// 新しいクライアントを生成
    pub fn new() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
        }
    }

    /// カスタムコマンド名を指定してクライアントを生成
    ///
    /// テストやカスタムインストール時に使用します。
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// CLIツールが利用可能かチェック
    ///
    /// # エラー
    ///
    /// - [`ProviderError::CliNotFound`] - CLIツールが見つからない
    async fn check_cli_available(&self) -> Result<(), ProviderError> {
        // Unix系では `which`、Windowsでは `where` を使用
        let check_command = if cfg!(target_os = "windows") {
            "where"
        } else {
            "which"
        };

        let output = Command::new(check_command)
            .arg(&self.command)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ProviderError::CliNotFound(
                self.command.clone(),
                NPM_PACKAGE.to_string(),
            ))
        }
    }
}

impl Default for ClaudeCliClient {
    fn default() -> Self {
        Self::new()
    }
}

/// CLI の JSON 出力（必要なフィールドのみ）
#[derive(Debug, Deserialize)]
struct CliOutput {
    result: String,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[async_trait]
impl CompletionClient for ClaudeCliClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_input: &str,
        tier: ModelTier,
    ) -> Result<CompletionResponse, ProviderError> {
        self.check_cli_available().await?;

        let model = claude_model(tier);
        let full_prompt = format!("{system_prompt}\n\n{user_input}");

        let output = Command::new(&self.command)
            .arg("-p")
            .arg(&full_prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(model)
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            // 認証エラーを検出
            if stderr.contains("authentication")
                || stderr.contains("login")
                || stderr.contains("API key")
            {
                return Err(ProviderError::Authentication(stderr.to_string()));
            }
            // レート制限を検出
            if stderr.contains("rate limit") || stderr.contains("429") {
                return Err(ProviderError::RateLimitExceeded);
            }
            return Err(ProviderError::CliExecution(format!(
                "終了コード {}: {}",
                output.status.code().unwrap_or(-1),
                stderr
            )));
        }

        let stdout = String::from_utf8(output.stdout)?;
        let parsed: CliOutput = serde_json::from_str(&stdout).map_err(|e| {
            ProviderError::InvalidResponse(format!("CLI の JSON 出力をパースできません: {e}"))
        })?;

        let token_usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: parsed.result,
            token_usage,
            model: model.to_string(),
        })
    }
}
