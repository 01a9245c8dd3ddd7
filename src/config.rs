//! テンプレート定義ファイルの読み込みと管理を行うモジュール
//!
//! # 責務
//!
//! このモジュールは、ワークフローテンプレートを TOML 形式で定義し、
//! それを Rust の型として扱うための機能を提供します。
//!
//! ## 主な機能
//!
//! - **TOML パース**: テンプレートファイルを読み込み、
//!   [`WorkflowTemplate`](crate::model::WorkflowTemplate) にデシリアライズ
//! - **バリデーション**: order の一意性・依存先の存在・依存グラフの
//!   非巡回性をロード時に検証
//!
//! ## 設計思想
//!
//! - **宣言的定義**: 会話ワークフローを TOML による宣言的な定義で記述可能にする
//! - **DTO 分離**: デシリアライズ専用の DTO とバリデーション済みの
//!   ドメインモデルを分離する
//!
//! ## 使用例
//!
//! ```toml
//! [template]
//! name = "Press Release"
//! description = "プレスリリース作成ワークフロー"
//!
//! [[steps]]
//! name = "Select Type"
//! type = "JSON_DIALOG"
//! role = "collection"
//! order = 1
//!
//! [[steps]]
//! name = "Collect Info"
//! type = "JSON_DIALOG"
//! order = 2
//! dependencies = ["Select Type"]
//! [steps.config]
//! essential = ["companyName", "announcementType"]
//! ```
//!
//! ## 関連モジュール
//!
//! - [`crate::registry`]: ロード済みテンプレートの検索
//! - [`crate::model`]: ドメインモデルの定義

pub mod dto;
pub mod loader;

pub use loader::{load_dir, template_from_file, template_from_toml};
