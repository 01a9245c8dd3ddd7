//! エラー型の定義
//!
//! # 責務
//!
//! このモジュールは、Kaiwa Flow 全体で使用されるエラー型を定義します。
//! エラーは関心事ごとに分割されています:
//!
//! - [`ConfigError`]: テンプレート定義ファイルの読み込み・バリデーション
//! - [`StoreError`]: 永続化コラボレーターとのやり取り
//! - [`TransportError`]: メッセージトランスポートとのやり取り
//! - [`ProviderError`]: 補完サービス（LLM）の呼び出し
//! - [`EngineError`]: オーケストレーションエンジン全体のエラー
//!
//! 分類パース失敗やタイムアウトのような「会話を壊さない」失敗は
//! エンジン内部でフォールバック応答に変換されるため、ここには現れません。

use thiserror::Error;

/// テンプレート設定関連のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    /// ファイルの読み込みに失敗
    #[error("テンプレートファイルの読み込みに失敗しました: {0}")]
    FileRead(#[from] std::io::Error),

    /// TOML のデシリアライズに失敗
    #[error("TOML のデシリアライズに失敗しました: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    /// バリデーションエラー（order 重複、依存先不在、循環など）
    #[error("テンプレートのバリデーションに失敗しました: {0}")]
    Validation(String),
}

/// 永続化ストア関連のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// ワークフローが存在しない
    #[error("ワークフローが見つかりません: {0}")]
    WorkflowNotFound(String),

    /// ステップが存在しない
    #[error("ステップが見つかりません: {0}")]
    StepNotFound(String),

    /// バックエンド固有の失敗
    #[error("ストア操作に失敗しました: {0}")]
    Backend(String),
}

/// メッセージトランスポート関連のエラー
#[derive(Debug, Error)]
pub enum TransportError {
    /// バックエンド固有の失敗
    #[error("メッセージ操作に失敗しました: {0}")]
    Backend(String),
}

/// 補完サービス（LLMプロバイダー）関連のエラー
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP リクエストに失敗
    #[error("HTTP リクエストに失敗しました: {0}")]
    Http(#[from] reqwest::Error),

    /// CLI ツールが見つからない
    #[error("CLI ツール '{0}' が見つかりません。インストール: npm install -g {1}")]
    CliNotFound(String, String),

    /// CLI 実行エラー
    #[error("CLI 実行に失敗しました: {0}")]
    CliExecution(String),

    /// 認証エラー（API キー未設定、未ログイン）
    #[error("認証に失敗しました: {0}")]
    Authentication(String),

    /// レート制限超過
    #[error("レート制限を超過しました")]
    RateLimitExceeded,

    /// タイムアウト
    #[error("補完サービスの呼び出しが {timeout_secs} 秒でタイムアウトしました")]
    Timeout { timeout_secs: u64 },

    /// 不正なレスポンス（JSON パース不能など）
    #[error("不正なレスポンス: {0}")]
    InvalidResponse(String),

    /// I/O エラー（プロセス起動失敗など）
    #[error("I/O エラー: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 変換エラー
    #[error("UTF-8 変換に失敗しました: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// オーケストレーションエンジンのエラー
///
/// 呼び出し元に伝播するリクエストレベルの失敗のみを表します。
/// 回復可能な失敗（分類パース失敗、サービスタイムアウト等）は
/// エンジン内部でフォールバック応答に変換されます。
#[derive(Debug, Error)]
pub enum EngineError {
    /// テンプレートが見つからない
    #[error("テンプレートが見つかりません: {0}")]
    TemplateNotFound(String),

    /// ワークフローが見つからない
    #[error("ワークフローが見つかりません: {0}")]
    WorkflowNotFound(String),

    /// ステップが見つからない
    #[error("ステップが見つかりません: {0}")]
    StepNotFound(String),

    /// スレッドにアクティブなワークフローが存在しない
    #[error("スレッド {0} にアクティブなワークフローがありません")]
    NoActiveWorkflow(String),

    /// ストア操作の失敗
    #[error(transparent)]
    Store(#[from] StoreError),

    /// トランスポート操作の失敗
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 補完サービスの回復不能な失敗
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// テンプレート設定の失敗
    #[error(transparent)]
    Config(#[from] ConfigError),
}
