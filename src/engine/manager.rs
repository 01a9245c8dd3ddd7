//! ワークフローインスタンスのライフサイクル管理
//!
//! # 責務
//!
//! - テンプレートからのワークフロー作成（ステップのスナップショット）
//! - 読み出し時のテンプレート設定の再マージ
//! - スレッドに対するアクティブワークフローの解決
//!   （複数アクティブ時は最新作成を正とし、警告ログを残す）

use std::sync::Arc;

use crate::error::EngineError;
use crate::model::{StepStatus, WorkflowInstance};
use crate::registry::TemplateRegistry;
use crate::store::{NewWorkflow, WorkflowStore};
use crate::transport::{MessageRole, MessageTransport};

/// ワークフローマネージャー
pub struct WorkflowManager {
    store: Arc<dyn WorkflowStore>,
    transport: Arc<dyn MessageTransport>,
    registry: Arc<TemplateRegistry>,
}

impl WorkflowManager {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        transport: Arc<dyn MessageTransport>,
        registry: Arc<TemplateRegistry>,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
        }
    }

    /// テンプレートからワークフローを作成する
    ///
    /// ステップ定義をスナップショットし、最初のステップを IN_PROGRESS
    /// で開始します。最初のステップにプロンプトがあれば送出します
    /// （`silent` が真の場合は送出しない）。
    ///
    /// # 引数
    ///
    /// - `template_ref`: テンプレートの ID または名前
    /// - `silent`: 開始プロンプトの送出を抑止するか
    pub async fn create_workflow(
        &self,
        thread_id: &str,
        template_ref: &str,
        silent: bool,
    ) -> Result<WorkflowInstance, EngineError> {
        let template = self
            .registry
            .resolve(template_ref)
            .ok_or_else(|| EngineError::TemplateNotFound(template_ref.to_string()))?;

        let workflow = self
            .store
            .create_workflow(NewWorkflow {
                thread_id: thread_id.to_string(),
                template_id: template.id.clone(),
                template_name: template.name.clone(),
            })
            .await?;
        tracing::info!(workflow = %workflow.id, template = %template.name, thread = %thread_id, "workflow created");

        let mut first_step_id = None;
        for (index, definition) in template.steps.iter().enumerate() {
            let status = if index == 0 {
                StepStatus::InProgress
            } else {
                StepStatus::Pending
            };
            let mut step = self.store.create_step(&workflow.id, definition, status).await?;

            if index == 0 {
                if let Some(prompt) = &step.prompt {
                    if !silent {
                        self.transport
                            .append(thread_id, prompt, MessageRole::Assistant)
                            .await?;
                    }
                    // silent でも送出済み扱いにして後段の再送を防ぐ
                    step.state.initial_prompt_sent = true;
                    self.store.update_step(&step).await?;
                }
                first_step_id = Some(step.id);
            }
        }

        if let Some(step_id) = &first_step_id {
            self.store
                .update_current_step(&workflow.id, Some(step_id))
                .await?;
        }

        self.get_workflow(&workflow.id).await
    }

    /// ワークフローを取得し、テンプレート設定を再マージする
    ///
    /// テンプレートの編集のうち構造的設定（フィールド階層・ゴール・
    /// 指示・自動実行フラグ）は実行中のインスタンスにも反映されます。
    /// 実行時状態はストアの値が常に優先されます。
    pub async fn get_workflow(&self, id: &str) -> Result<WorkflowInstance, EngineError> {
        let mut workflow = self.store.get_workflow(id).await?;
        self.remerge_config(&mut workflow);
        Ok(workflow)
    }

    /// スレッドのアクティブワークフローを解決する
    ///
    /// 不変条件「1 スレッドにつきアクティブは高々 1 つ」の違反を
    /// 検出した場合は、最新作成のものを正として警告ログを残します。
    pub async fn get_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        let all = self.store.workflows_by_thread(thread_id).await?;
        let active: Vec<&WorkflowInstance> = all.iter().filter(|w| w.is_active()).collect();

        if active.len() > 1 {
            tracing::warn!(
                thread = %thread_id,
                count = active.len(),
                "multiple active workflows on one thread, using most recent"
            );
        }

        // workflows_by_thread は作成時刻の昇順なので末尾が最新
        match active.last() {
            Some(found) => {
                let mut workflow = (*found).clone();
                self.remerge_config(&mut workflow);
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    fn remerge_config(&self, workflow: &mut WorkflowInstance) {
        let Some(template) = self.registry.get_by_id(&workflow.template_id) else {
            // テンプレートが削除済みでもスナップショットで動き続ける
            tracing::debug!(
                workflow = %workflow.id,
                template = %workflow.template_id,
                "template no longer registered, keeping snapshot config"
            );
            return;
        };
        for step in &mut workflow.steps {
            if let Some(definition) = template.step_by_name(&step.name) {
                step.config = definition.config.clone();
                step.prompt = definition.prompt.clone();
            }
        }
    }
}
