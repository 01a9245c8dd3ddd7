//! 自動実行カスケード
//!
//! # 責務
//!
//! - ステップ完了後の前進と、自動実行可能なステップの連鎖実行
//! - 連鎖の深さ制限（設定ミスによる暴走の最後の砦。テンプレートの
//!   循環はロード時のバリデーションで排除済み）
//!
//! カスケードの最終結果は再帰の各段を通って最初の呼び出し元まで
//! 伝播します。

use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::model::WorkflowInstance;
use crate::transport::MessageRole;

use super::executor::WorkflowEngine;
use super::result::NextStep;

/// カスケードの最大深さ
pub const MAX_CASCADE_DEPTH: u32 = 16;

/// 自動実行ステップに渡される合成入力
pub const AUTO_EXECUTE_INPUT: &str = "[自動実行]";

/// 実行不能な状態のときの説明文
pub const INCONSISTENT_STATE_MESSAGE: &str =
    "ワークフローを先に進められない状態です。お手数ですが管理者にお問い合わせください。";

/// カスケード 1 段の結果
#[derive(Debug, Clone, Default)]
pub(crate) struct CascadeOutcome {
    /// ユーザーへ返す応答文
    pub text: Option<String>,
    /// この段以降で完了したステップ数
    pub steps_advanced: u32,
    /// ワークフローが完了したか
    pub workflow_completed: bool,
    /// 遷移で開始された新ワークフロー ID
    pub transitioned_to: Option<String>,
}

impl WorkflowEngine {
    /// ステップ完了後の前進処理
    ///
    /// 次ステップを開始し、それが自動実行可能なら合成入力で
    /// 再帰的に処理します。ワークフロー完了時は遷移コントローラーへ
    /// 委譲します。
    pub(crate) async fn advance_and_cascade(
        &self,
        workflow: &mut WorkflowInstance,
        chunks: Option<mpsc::Sender<String>>,
        depth: u32,
    ) -> Result<CascadeOutcome, EngineError> {
        match self.state.advance(workflow).await? {
            NextStep::WorkflowComplete => {
                let transition = self
                    .transition
                    .on_workflow_completed(&self.manager, workflow)
                    .await?;
                self.state
                    .emit_once(&workflow.thread_id, &transition.message, MessageRole::Assistant)
                    .await?;
                Ok(CascadeOutcome {
                    text: Some(transition.message),
                    steps_advanced: 0,
                    workflow_completed: true,
                    transitioned_to: transition.new_workflow.map(|w| w.id),
                })
            }
            NextStep::Inconsistent { .. } => {
                self.state
                    .emit_once(
                        &workflow.thread_id,
                        INCONSISTENT_STATE_MESSAGE,
                        MessageRole::Assistant,
                    )
                    .await?;
                Ok(CascadeOutcome {
                    text: Some(INCONSISTENT_STATE_MESSAGE.to_string()),
                    ..Default::default()
                })
            }
            NextStep::Step(next) => {
                let auto = next.config.auto_execute && next.step_type.supports_headless();
                if !auto {
                    // 開始プロンプトは activate 済み。応答の補欠として返す。
                    return Ok(CascadeOutcome {
                        text: next.prompt.clone(),
                        ..Default::default()
                    });
                }
                if depth >= MAX_CASCADE_DEPTH {
                    tracing::warn!(
                        workflow = %workflow.id,
                        step = %next.name,
                        depth,
                        "cascade depth limit reached, waiting for user input"
                    );
                    return Ok(CascadeOutcome {
                        text: next.prompt.clone(),
                        ..Default::default()
                    });
                }
                tracing::debug!(step = %next.name, depth, "auto-executing step");
                self.process_step_boxed(workflow, &next.id, AUTO_EXECUTE_INPUT, chunks, depth + 1)
                    .await
            }
        }
    }
}
