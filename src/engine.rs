//! 会話型ワークフローオーケストレーションエンジン
//!
//! # 責務
//!
//! - ユーザーメッセージを現在のステップへディスパッチし、完了分類・
//!   文脈伝播・自動実行カスケード・ワークフロー遷移を統合する
//!
//! # モジュール構成
//!
//! - [`result`] - 入出力型（[`Verdict`] / [`StepOutcome`] / [`EngineResponse`]）
//! - [`context`] - ワークフロー文脈の集約と注入
//! - [`classifier`] - 完了分類プロトコル
//! - [`handlers`] - 役割ベースのステップハンドラー
//! - [`state`] - ステップ状態機械
//! - [`manager`] - ワークフローインスタンスのライフサイクル
//! - [`cascade`] - 自動実行カスケード
//! - [`transition`] - ワークフロー遷移コントローラー
//! - [`executor`] - エンジン本体（[`WorkflowEngine`]）

pub mod cascade;
pub mod classifier;
pub mod context;
pub mod executor;
pub mod handlers;
pub mod manager;
pub mod result;
pub mod state;
pub mod transition;

pub use executor::WorkflowEngine;
pub use manager::WorkflowManager;
pub use result::{EngineResponse, NextStep, StepOutcome, Verdict};
pub use state::{StepStateMachine, select_next_step};
pub use transition::{TransitionController, TransitionOutcome};
