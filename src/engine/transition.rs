//! ワークフロー遷移コントローラー
//!
//! # 責務
//!
//! - セレクターワークフロー完了時に、記録された選択結果から次の
//!   ワークフローを開始する
//! - 非セレクターの完了時は完了メッセージを返すだけ
//!
//! 遷移時のテンプレート照合は名前の完全一致のみです。あいまい照合は
//! 選択ステップの時点（[`super::handlers::SelectionHandler`]）で済んで
//! おり、ここで再びあいまいに解決すると意図しないワークフローが
//! 始まるためです。照合に失敗しても呼び出しは失敗させず、
//! ユーザーへの説明メッセージに変換します。

use std::sync::Arc;

use crate::error::EngineError;
use crate::model::WorkflowInstance;
use crate::registry::TemplateRegistry;

use super::manager::WorkflowManager;

/// 遷移処理の結果
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// ユーザーへ返すメッセージ
    pub message: String,
    /// 新たに開始されたワークフロー（遷移した場合のみ）
    pub new_workflow: Option<WorkflowInstance>,
}

/// ワークフロー遷移コントローラー
pub struct TransitionController {
    registry: Arc<TemplateRegistry>,
}

impl TransitionController {
    pub fn new(registry: Arc<TemplateRegistry>) -> Self {
        Self { registry }
    }

    /// ワークフロー完了時の遷移処理
    ///
    /// 完了したワークフローが Selection ステップを持ち、解決済みの
    /// 選択結果が記録されていれば、そのテンプレートで新しい
    /// ワークフローを同一スレッド上に開始します（開始プロンプト付き）。
    pub async fn on_workflow_completed(
        &self,
        manager: &WorkflowManager,
        completed: &WorkflowInstance,
    ) -> Result<TransitionOutcome, EngineError> {
        let selected = completed
            .selection_step()
            .and_then(|s| s.state.selected_template.clone());

        let Some(selected) = selected else {
            return Ok(TransitionOutcome {
                message: format!("「{}」が完了しました。", completed.template_name),
                new_workflow: None,
            });
        };

        // 完全一致のみ。ここでのあいまい照合は誤遷移のもと。
        let Some(template) = self.registry.get_by_name(&selected) else {
            tracing::warn!(
                workflow = %completed.id,
                selected = %selected,
                "selected template not found at transition time"
            );
            return Ok(TransitionOutcome {
                message: format!(
                    "「{selected}」のテンプレートが見つかりませんでした。\
                     利用可能なワークフローをご確認のうえ、もう一度お選びください。"
                ),
                new_workflow: None,
            });
        };

        let new_workflow = manager
            .create_workflow(&completed.thread_id, &template.id, false)
            .await?;
        tracing::info!(
            from = %completed.id,
            to = %new_workflow.id,
            template = %template.name,
            "workflow transition"
        );
        Ok(TransitionOutcome {
            message: format!("「{}」の作成を開始します。", template.name),
            new_workflow: Some(new_workflow),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        StepConfig, StepDefinition, StepInstance, StepRole, StepRuntimeState, StepStatus,
        StepType, WorkflowStatus, WorkflowTemplate,
    };
    use crate::store::MemoryStore;
    use crate::transport::MemoryTransport;
    use std::time::SystemTime;

    fn press_release_template() -> WorkflowTemplate {
        WorkflowTemplate {
            id: "press-release".to_string(),
            name: "Press Release".to_string(),
            description: None,
            steps: vec![StepDefinition {
                name: "gather".to_string(),
                step_type: StepType::JsonDialog,
                role: StepRole::Collection,
                order: 1,
                dependencies: vec![],
                prompt: Some("始めましょう".to_string()),
                config: StepConfig::default(),
            }],
        }
    }

    fn completed_selector(selected: Option<&str>) -> WorkflowInstance {
        let mut state = StepRuntimeState::default();
        state.selected_template = selected.map(|s| s.to_string());
        WorkflowInstance {
            id: "wf-sel".to_string(),
            thread_id: "th-1".to_string(),
            template_id: "selector".to_string(),
            template_name: "Selector".to_string(),
            status: WorkflowStatus::Completed,
            current_step_id: None,
            created_at: SystemTime::now(),
            steps: vec![StepInstance {
                id: "step-1".to_string(),
                workflow_id: "wf-sel".to_string(),
                name: "select".to_string(),
                step_type: StepType::JsonDialog,
                role: StepRole::Selection,
                order: 1,
                status: StepStatus::Complete,
                dependencies: vec![],
                prompt: None,
                user_input: None,
                ai_suggestion: None,
                config: StepConfig::default(),
                state,
            }],
        }
    }

    fn setup() -> (TransitionController, WorkflowManager) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(TemplateRegistry::new());
        registry.register(press_release_template()).unwrap();
        let manager = WorkflowManager::new(store, transport, registry.clone());
        (TransitionController::new(registry), manager)
    }

    /// セレクター完了で選択先のワークフローが開始される
    #[tokio::test]
    async fn test_transition_starts_selected_workflow() {
        let (controller, manager) = setup();
        let completed = completed_selector(Some("Press Release"));

        let outcome = controller
            .on_workflow_completed(&manager, &completed)
            .await
            .unwrap();
        let new_workflow = outcome.new_workflow.expect("should transition");
        assert_eq!(new_workflow.template_name, "Press Release");
        assert_eq!(new_workflow.thread_id, "th-1");
        assert!(outcome.message.contains("Press Release"));
    }

    /// 照合は完全一致のみ（部分一致では遷移しない）
    #[tokio::test]
    async fn test_transition_requires_exact_name() {
        let (controller, manager) = setup();
        let completed = completed_selector(Some("press"));

        let outcome = controller
            .on_workflow_completed(&manager, &completed)
            .await
            .unwrap();
        assert!(outcome.new_workflow.is_none());
        assert!(outcome.message.contains("見つかりませんでした"));
    }

    /// 非セレクターの完了は完了メッセージのみ
    #[tokio::test]
    async fn test_non_selector_completion() {
        let (controller, manager) = setup();
        let mut completed = completed_selector(None);
        completed.steps[0].role = StepRole::Collection;

        let outcome = controller
            .on_workflow_completed(&manager, &completed)
            .await
            .unwrap();
        assert!(outcome.new_workflow.is_none());
        assert!(outcome.message.contains("完了"));
    }
}
