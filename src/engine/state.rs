//! ステップ状態機械
//!
//! # 責務
//!
//! - 依存関係に基づく次ステップの選択（純粋関数）
//! - ステップの開始・完了・失敗・ロールバックの遷移と永続化
//! - 開始プロンプトの冪等な送出（重複抑止）
//!
//! ステータス遷移はすべてこのモジュールを通ります。不正な遷移は
//! 警告ログを残して拒否されます。

use std::sync::Arc;

use crate::error::EngineError;
use crate::model::{StepStatus, WorkflowInstance, WorkflowStatus};
use crate::store::WorkflowStore;
use crate::transport::{MessageRole, MessageTransport};

use super::context;
use super::result::NextStep;

/// プロンプト重複抑止のために走査する直近メッセージ数
pub const DUPLICATE_SCAN_WINDOW: usize = 5;

/// ワークフロー完了時の通知文
pub const WORKFLOW_COMPLETE_NOTICE: &str = "すべてのステップが完了しました。";

/// 次に実行すべきステップを選択（純粋関数）
///
/// PENDING のステップを order 昇順に走査し、依存がすべて COMPLETE の
/// 最初のものを返します。実行可能なステップがない場合、全ステップが
/// COMPLETE なら [`NextStep::WorkflowComplete`]、そうでなければ
/// [`NextStep::Inconsistent`] です。
pub fn select_next_step(workflow: &WorkflowInstance) -> NextStep {
    for step in &workflow.steps {
        if step.status != StepStatus::Pending {
            continue;
        }
        let deps_met = step.dependencies.iter().all(|dep| {
            workflow
                .step_by_name(dep)
                .map(|d| d.status == StepStatus::Complete)
                .unwrap_or(false)
        });
        if deps_met {
            return NextStep::Step(step.clone());
        }
    }

    if workflow.all_steps_complete() {
        NextStep::WorkflowComplete
    } else {
        let pending: Vec<String> = workflow
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.name.clone())
            .collect();
        NextStep::Inconsistent { pending }
    }
}

/// ステップ状態機械
pub struct StepStateMachine {
    store: Arc<dyn WorkflowStore>,
    transport: Arc<dyn MessageTransport>,
}

impl StepStateMachine {
    pub fn new(store: Arc<dyn WorkflowStore>, transport: Arc<dyn MessageTransport>) -> Self {
        Self { store, transport }
    }

    /// 直近に同一本文がなければメッセージを送出（重複抑止）
    pub async fn emit_once(
        &self,
        thread_id: &str,
        text: &str,
        role: MessageRole,
    ) -> Result<(), EngineError> {
        let recent = self.transport.recent(thread_id, DUPLICATE_SCAN_WINDOW).await?;
        if recent.iter().any(|m| m.text == text) {
            tracing::debug!(thread = %thread_id, "suppressed duplicate message");
            return Ok(());
        }
        self.transport.append(thread_id, text, role).await?;
        Ok(())
    }

    /// ステップを開始する
    ///
    /// 集約済み文脈を注入し、ステータスを IN_PROGRESS へ遷移、
    /// 現在ステップを更新します。開始プロンプトは未送出の場合のみ
    /// 送出します（`initial_prompt_sent` と直近走査の二重の抑止）。
    pub async fn activate_step(
        &self,
        workflow: &mut WorkflowInstance,
        step_id: &str,
    ) -> Result<(), EngineError> {
        let ctx = context::gather_context(workflow);
        let thread_id = workflow.thread_id.clone();
        let workflow_id = workflow.id.clone();

        let step = workflow
            .step_by_id_mut(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

        context::initialize_step_with_context(step, &ctx);

        if step.status == StepStatus::Pending {
            step.status = StepStatus::InProgress;
        } else if step.status != StepStatus::InProgress {
            tracing::warn!(
                step = %step.name,
                status = ?step.status,
                "refusing to activate step from terminal status"
            );
            return Ok(());
        }

        let prompt_to_send = if !step.state.initial_prompt_sent {
            step.prompt.clone()
        } else {
            None
        };
        if prompt_to_send.is_some() {
            step.state.initial_prompt_sent = true;
        }

        tracing::info!(workflow = %workflow_id, step = %step.name, "step activated");
        let snapshot = step.clone();
        self.store.update_step(&snapshot).await?;
        self.store
            .update_current_step(&workflow_id, Some(step_id))
            .await?;
        workflow.current_step_id = Some(step_id.to_string());

        if let Some(prompt) = prompt_to_send {
            self.emit_once(&thread_id, &prompt, MessageRole::Assistant)
                .await?;
        }
        Ok(())
    }

    /// ステップを終端状態へ遷移させる
    ///
    /// `Pending → InProgress → {Complete, Failed}` の単調性に反する
    /// 遷移は警告ログを残して無視されます。
    pub async fn finish_step(
        &self,
        workflow: &mut WorkflowInstance,
        step_id: &str,
        status: StepStatus,
    ) -> Result<(), EngineError> {
        let workflow_id = workflow.id.clone();
        let step = workflow
            .step_by_id_mut(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

        if !step.status.can_advance_to(status) {
            tracing::warn!(
                step = %step.name,
                from = ?step.status,
                to = ?status,
                "invalid status transition ignored"
            );
            return Ok(());
        }
        step.status = status;
        tracing::info!(workflow = %workflow_id, step = %step.name, status = ?status, "step finished");
        let snapshot = step.clone();
        self.store.update_step(&snapshot).await?;
        Ok(())
    }

    /// 次ステップへ前進する
    ///
    /// 次ステップがあれば開始し、全完了ならワークフローを終端化して
    /// 完了通知を送出します。
    pub async fn advance(
        &self,
        workflow: &mut WorkflowInstance,
    ) -> Result<NextStep, EngineError> {
        let next = select_next_step(workflow);
        match &next {
            NextStep::Step(step) => {
                let step_id = step.id.clone();
                self.activate_step(workflow, &step_id).await?;
            }
            NextStep::WorkflowComplete => {
                self.store
                    .update_workflow_status(&workflow.id, WorkflowStatus::Completed)
                    .await?;
                self.store.update_current_step(&workflow.id, None).await?;
                workflow.status = WorkflowStatus::Completed;
                workflow.current_step_id = None;
                tracing::info!(workflow = %workflow.id, "workflow completed");
                self.emit_once(
                    &workflow.thread_id,
                    WORKFLOW_COMPLETE_NOTICE,
                    MessageRole::System,
                )
                .await?;
            }
            NextStep::Inconsistent { pending } => {
                tracing::error!(
                    workflow = %workflow.id,
                    pending = ?pending,
                    "no eligible step but workflow is not complete"
                );
            }
        }
        Ok(next)
    }

    /// 終端状態のステップを PENDING に巻き戻す（明示的な運用操作）
    ///
    /// 終端状態でないステップへの適用は警告ログを残して何もしません。
    pub async fn rollback_step(
        &self,
        workflow: &mut WorkflowInstance,
        step_id: &str,
    ) -> Result<(), EngineError> {
        let workflow_id = workflow.id.clone();
        let step = workflow
            .step_by_id_mut(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

        if !step.status.is_terminal() {
            tracing::warn!(step = %step.name, status = ?step.status, "rollback ignored for non-terminal step");
            return Ok(());
        }
        step.status = StepStatus::Pending;
        step.state.initial_prompt_sent = false;
        tracing::info!(workflow = %workflow_id, step = %step.name, "step rolled back to pending");
        let snapshot = step.clone();
        self.store.update_step(&snapshot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StepConfig, StepInstance, StepRole, StepRuntimeState, StepType};
    use crate::store::{MemoryStore, NewWorkflow};
    use crate::transport::MemoryTransport;
    use std::time::SystemTime;

    fn step(name: &str, order: u32, status: StepStatus, deps: &[&str]) -> StepInstance {
        StepInstance {
            id: format!("step-{order}"),
            workflow_id: "wf-1".to_string(),
            name: name.to_string(),
            step_type: StepType::JsonDialog,
            role: StepRole::Collection,
            order,
            status,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            prompt: None,
            user_input: None,
            ai_suggestion: None,
            config: StepConfig::default(),
            state: StepRuntimeState::default(),
        }
    }

    fn workflow(steps: Vec<StepInstance>) -> WorkflowInstance {
        WorkflowInstance {
            id: "wf-1".to_string(),
            thread_id: "th-1".to_string(),
            template_id: "tpl".to_string(),
            template_name: "Template".to_string(),
            status: WorkflowStatus::Active,
            current_step_id: None,
            created_at: SystemTime::now(),
            steps,
        }
    }

    /// 依存が満たされた最初の PENDING ステップが選ばれる
    #[test]
    fn test_select_next_step_respects_dependencies() {
        let wf = workflow(vec![
            step("a", 1, StepStatus::Complete, &[]),
            step("b", 2, StepStatus::Pending, &["a"]),
            step("c", 3, StepStatus::Pending, &["b"]),
        ]);
        match select_next_step(&wf) {
            NextStep::Step(s) => assert_eq!(s.name, "b"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// 依存未充足のステップはスキップされる
    #[test]
    fn test_select_next_step_skips_blocked() {
        let wf = workflow(vec![
            step("a", 1, StepStatus::InProgress, &[]),
            step("b", 2, StepStatus::Pending, &["a"]),
            step("c", 3, StepStatus::Pending, &[]),
        ]);
        match select_next_step(&wf) {
            NextStep::Step(s) => assert_eq!(s.name, "c"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// 全ステップ完了でワークフロー完了
    #[test]
    fn test_select_next_step_workflow_complete() {
        let wf = workflow(vec![
            step("a", 1, StepStatus::Complete, &[]),
            step("b", 2, StepStatus::Complete, &["a"]),
        ]);
        assert!(matches!(select_next_step(&wf), NextStep::WorkflowComplete));
    }

    /// FAILED で詰まった場合は不整合として検出される
    #[test]
    fn test_select_next_step_inconsistent_on_failed_dependency() {
        let wf = workflow(vec![
            step("a", 1, StepStatus::Failed, &[]),
            step("b", 2, StepStatus::Pending, &["a"]),
        ]);
        match select_next_step(&wf) {
            NextStep::Inconsistent { pending } => assert_eq!(pending, vec!["b"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    async fn seeded_machine() -> (StepStateMachine, Arc<MemoryStore>, Arc<MemoryTransport>, WorkflowInstance) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let wf = store
            .create_workflow(NewWorkflow {
                thread_id: "th-1".to_string(),
                template_id: "tpl".to_string(),
                template_name: "Template".to_string(),
            })
            .await
            .unwrap();
        let machine = StepStateMachine::new(store.clone(), transport.clone());
        (machine, store, transport, wf)
    }

    fn definition(name: &str, order: u32, prompt: Option<&str>) -> crate::model::StepDefinition {
        crate::model::StepDefinition {
            name: name.to_string(),
            step_type: StepType::JsonDialog,
            role: StepRole::Collection,
            order,
            dependencies: vec![],
            prompt: prompt.map(|p| p.to_string()),
            config: StepConfig::default(),
        }
    }

    /// 開始プロンプトは一度だけ送出される
    #[tokio::test]
    async fn test_activate_step_emits_prompt_once() {
        let (machine, store, transport, wf) = seeded_machine().await;
        let created = store
            .create_step(&wf.id, &definition("a", 1, Some("最初の質問です")), StepStatus::Pending)
            .await
            .unwrap();
        let mut wf = store.get_workflow(&wf.id).await.unwrap();

        machine.activate_step(&mut wf, &created.id).await.unwrap();
        machine.activate_step(&mut wf, &created.id).await.unwrap();

        let messages = transport.recent("th-1", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "最初の質問です");

        let loaded = store.get_step(&wf.id, &created.id).await.unwrap();
        assert_eq!(loaded.status, StepStatus::InProgress);
        assert!(loaded.state.initial_prompt_sent);
        assert_eq!(wf.current_step_id.as_deref(), Some(created.id.as_str()));
    }

    /// 不正な遷移（PENDING → COMPLETE）は無視される
    #[tokio::test]
    async fn test_finish_step_rejects_invalid_transition() {
        let (machine, store, _transport, wf) = seeded_machine().await;
        let created = store
            .create_step(&wf.id, &definition("a", 1, None), StepStatus::Pending)
            .await
            .unwrap();
        let mut wf = store.get_workflow(&wf.id).await.unwrap();

        machine
            .finish_step(&mut wf, &created.id, StepStatus::Complete)
            .await
            .unwrap();
        let loaded = store.get_step(&wf.id, &created.id).await.unwrap();
        assert_eq!(loaded.status, StepStatus::Pending);
    }

    /// 全完了後の前進はワークフローを終端化する
    #[tokio::test]
    async fn test_advance_completes_workflow() {
        let (machine, store, transport, wf) = seeded_machine().await;
        let created = store
            .create_step(&wf.id, &definition("a", 1, None), StepStatus::InProgress)
            .await
            .unwrap();
        let mut wf = store.get_workflow(&wf.id).await.unwrap();

        machine
            .finish_step(&mut wf, &created.id, StepStatus::Complete)
            .await
            .unwrap();
        let next = machine.advance(&mut wf).await.unwrap();
        assert!(matches!(next, NextStep::WorkflowComplete));
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(wf.current_step_id.is_none());

        let messages = transport.recent("th-1", 10).await.unwrap();
        assert!(messages.iter().any(|m| m.text == WORKFLOW_COMPLETE_NOTICE));
    }

    /// ロールバックは終端状態のステップのみ PENDING へ戻す
    #[tokio::test]
    async fn test_rollback_step() {
        let (machine, store, _transport, wf) = seeded_machine().await;
        let created = store
            .create_step(&wf.id, &definition("a", 1, None), StepStatus::InProgress)
            .await
            .unwrap();
        let mut wf = store.get_workflow(&wf.id).await.unwrap();

        // 非終端はロールバック不可
        machine.rollback_step(&mut wf, &created.id).await.unwrap();
        assert_eq!(
            store.get_step(&wf.id, &created.id).await.unwrap().status,
            StepStatus::InProgress
        );

        machine
            .finish_step(&mut wf, &created.id, StepStatus::Failed)
            .await
            .unwrap();
        machine.rollback_step(&mut wf, &created.id).await.unwrap();
        assert_eq!(
            store.get_step(&wf.id, &created.id).await.unwrap().status,
            StepStatus::Pending
        );
    }
}
