//! Kaiwa Flow - 会話型マルチステップワークフローのオーケストレーション
//!
//! ユーザーとの対話を通じて情報を集め、コンテンツを生成し、レビューを
//! 経て次のワークフローへ遷移する一連の流れを、テンプレート駆動の
//! ステップ状態機械として実行します。
//!
//! # 主要な構成要素
//!
//! - [`model`]: テンプレート・インスタンス・ステータスのコアデータモデル
//! - [`config`]: TOML テンプレート定義の読み込みとバリデーション
//! - [`registry`]: テンプレートの登録と検索
//! - [`store`] / [`transport`]: 永続化とメッセージ送受のコラボレーター契約
//! - [`provider`]: 補完サービス（LLM）の抽象化
//! - [`engine`]: オーケストレーションエンジン本体
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kaiwa_flow::engine::WorkflowEngine;
//! use kaiwa_flow::provider::{create_client, ProviderKind};
//! use kaiwa_flow::registry::TemplateRegistry;
//! use kaiwa_flow::store::MemoryStore;
//! use kaiwa_flow::transport::MemoryTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(TemplateRegistry::from_dir("templates")?);
//!     let engine = WorkflowEngine::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryTransport::new()),
//!         Arc::from(create_client(ProviderKind::Claude)?),
//!         registry,
//!     );
//!
//!     let response = engine.handle_message("thread-1", "新製品を発表したい").await?;
//!     println!("{}", response.text);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod provider;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod transport;

// 公開APIの再エクスポート
pub use engine::{EngineResponse, WorkflowEngine};
pub use error::EngineError;
pub use model::{WorkflowInstance, WorkflowTemplate};
pub use registry::TemplateRegistry;
