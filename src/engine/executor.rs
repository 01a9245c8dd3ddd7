//! ワークフローエンジン本体
//!
//! # 責務
//!
//! - ユーザーメッセージ 1 件の処理（通常版・ストリーミング版）
//! - アクティブワークフローの解決と現在ステップへのディスパッチ
//! - 重複送信の吸収
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kaiwa_flow::engine::WorkflowEngine;
//! use kaiwa_flow::registry::TemplateRegistry;
//! use kaiwa_flow::store::MemoryStore;
//! use kaiwa_flow::transport::MemoryTransport;
//! use kaiwa_flow::provider::{create_client, ProviderKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(TemplateRegistry::from_dir("templates")?);
//! let engine = WorkflowEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryTransport::new()),
//!     Arc::from(create_client(ProviderKind::Claude)?),
//!     registry,
//! )
//! .with_fallback_template("Selector");
//!
//! let response = engine.handle_message("thread-1", "プレスリリースを作りたい").await?;
//! println!("{}", response.text);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::model::{StepStatus, WorkflowInstance};
use crate::provider::CompletionClient;
use crate::registry::TemplateRegistry;
use crate::store::WorkflowStore;
use crate::transport::{MessageRole, MessageTransport};

use super::cascade::{AUTO_EXECUTE_INPUT, CascadeOutcome};
use super::classifier::{CompletionClassifier, DEFAULT_TIMEOUT, HISTORY_LIMIT};
use super::handlers::{HandlerDeps, handler_for};
use super::manager::WorkflowManager;
use super::result::{EngineResponse, NextStep};
use super::state::{DUPLICATE_SCAN_WINDOW, StepStateMachine, select_next_step};
use super::transition::TransitionController;

/// ワークフローエンジン
///
/// すべてのコラボレーター（ストア・トランスポート・補完サービス・
/// レジストリ）を束ね、メッセージ単位の処理を提供します。
pub struct WorkflowEngine {
    pub(crate) transport: Arc<dyn MessageTransport>,
    pub(crate) store: Arc<dyn WorkflowStore>,
    pub(crate) registry: Arc<TemplateRegistry>,
    completion: Arc<dyn CompletionClient>,
    pub(crate) classifier: CompletionClassifier,
    pub(crate) manager: WorkflowManager,
    pub(crate) state: StepStateMachine,
    pub(crate) transition: TransitionController,
    fallback_template: Option<String>,
}

impl WorkflowEngine {
    /// エンジンを構築する
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        transport: Arc<dyn MessageTransport>,
        completion: Arc<dyn CompletionClient>,
        registry: Arc<TemplateRegistry>,
    ) -> Self {
        Self {
            classifier: CompletionClassifier::new(completion.clone(), DEFAULT_TIMEOUT),
            manager: WorkflowManager::new(store.clone(), transport.clone(), registry.clone()),
            state: StepStateMachine::new(store.clone(), transport.clone()),
            transition: TransitionController::new(registry.clone()),
            store,
            transport,
            registry,
            completion,
            fallback_template: None,
        }
    }

    /// 補完サービス呼び出しのタイムアウトを変更する
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.classifier = CompletionClassifier::new(self.completion.clone(), timeout);
        self
    }

    /// アクティブワークフローがないスレッドで自動開始するテンプレート
    /// （通常はセレクター）を設定する
    pub fn with_fallback_template(mut self, template_ref: impl Into<String>) -> Self {
        self.fallback_template = Some(template_ref.into());
        self
    }

    /// ワークフローマネージャーへの参照
    pub fn manager(&self) -> &WorkflowManager {
        &self.manager
    }

    /// ユーザーメッセージを 1 件処理する
    pub async fn handle_message(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<EngineResponse, EngineError> {
        self.handle_inner(thread_id, text, None).await
    }

    /// ストリーミング版のメッセージ処理
    ///
    /// 生成系ステップの増分テキストが `chunks` へ送出されます。
    /// 受信側が途中で閉じても処理は継続し、最終応答が返ります。
    pub async fn handle_message_streaming(
        &self,
        thread_id: &str,
        text: &str,
        chunks: mpsc::Sender<String>,
    ) -> Result<EngineResponse, EngineError> {
        self.handle_inner(thread_id, text, Some(chunks)).await
    }

    /// 終端状態のステップを PENDING に巻き戻す（運用操作）
    pub async fn rollback_step(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<(), EngineError> {
        let mut workflow = self.manager.get_workflow(workflow_id).await?;
        self.state.rollback_step(&mut workflow, step_id).await
    }

    async fn handle_inner(
        &self,
        thread_id: &str,
        text: &str,
        chunks: Option<mpsc::Sender<String>>,
    ) -> Result<EngineResponse, EngineError> {
        let mut workflow = match self.manager.get_by_thread(thread_id).await? {
            Some(found) => found,
            None => match &self.fallback_template {
                Some(template_ref) => {
                    tracing::info!(thread = %thread_id, "no active workflow, starting fallback template");
                    self.manager.create_workflow(thread_id, template_ref, true).await?
                }
                None => return Err(EngineError::NoActiveWorkflow(thread_id.to_string())),
            },
        };

        // 直前と同一の入力で、すでに応答済みなら吸収する
        if let Some(previous_reply) = self.absorb_duplicate(thread_id, text).await? {
            return Ok(EngineResponse {
                text: previous_reply,
                workflow_id: workflow.id,
                ..Default::default()
            });
        }

        self.transport
            .append(thread_id, text, MessageRole::User)
            .await?;

        let step_id = self.resolve_current_step(&mut workflow).await?;
        let outcome = self
            .process_step(&mut workflow, &step_id, text, chunks, 0)
            .await?;

        let reply = match outcome.text {
            Some(reply) => reply,
            None => workflow
                .current_step()
                .and_then(|s| s.prompt.clone())
                .unwrap_or_default(),
        };
        Ok(EngineResponse {
            text: reply,
            workflow_id: workflow.id.clone(),
            workflow_completed: outcome.workflow_completed,
            transitioned_to: outcome.transitioned_to,
            steps_advanced: outcome.steps_advanced,
        })
    }

    /// 直前のユーザー入力と同一で応答済みなら、その応答を返す
    async fn absorb_duplicate(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<Option<String>, EngineError> {
        let recent = self.transport.recent(thread_id, DUPLICATE_SCAN_WINDOW).await?;
        let last_user = recent.iter().rev().find(|m| m.role == MessageRole::User);
        let answered = recent
            .last()
            .map(|m| m.role == MessageRole::Assistant)
            .unwrap_or(false);
        if answered && last_user.map(|m| m.text == text).unwrap_or(false) {
            tracing::debug!(thread = %thread_id, "duplicate submission absorbed");
            let previous_reply = recent
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::Assistant)
                .map(|m| m.text.clone())
                .unwrap_or_default();
            return Ok(Some(previous_reply));
        }
        Ok(None)
    }

    /// 現在ステップを解決する（未設定なら選択して開始する）
    async fn resolve_current_step(
        &self,
        workflow: &mut WorkflowInstance,
    ) -> Result<String, EngineError> {
        if let Some(step_id) = workflow.current_step_id.clone() {
            let pending = workflow
                .step_by_id(&step_id)
                .map(|s| s.status == StepStatus::Pending)
                .unwrap_or(false);
            if pending {
                self.state.activate_step(workflow, &step_id).await?;
            }
            return Ok(step_id);
        }

        // 現在ステップが未設定（異常系からの復帰）
        match select_next_step(workflow) {
            NextStep::Step(step) => {
                let step_id = step.id.clone();
                tracing::warn!(workflow = %workflow.id, step = %step.name, "current step missing, re-activating");
                self.state.activate_step(workflow, &step_id).await?;
                Ok(step_id)
            }
            _ => Err(EngineError::NoActiveWorkflow(workflow.thread_id.clone())),
        }
    }

    /// 現在ステップを処理する（完了時はカスケードへ委譲）
    pub(crate) async fn process_step(
        &self,
        workflow: &mut WorkflowInstance,
        step_id: &str,
        input: &str,
        chunks: Option<mpsc::Sender<String>>,
        depth: u32,
    ) -> Result<CascadeOutcome, EngineError> {
        let step = workflow
            .step_by_id(step_id)
            .cloned()
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
        let history = self.transport.recent(&workflow.thread_id, HISTORY_LIMIT).await?;

        let deps = HandlerDeps {
            classifier: &self.classifier,
            registry: &self.registry,
            chunks: chunks.clone(),
        };
        let outcome = handler_for(step.role).handle(&step, input, &history, &deps).await;

        let synthetic = input == AUTO_EXECUTE_INPUT;
        {
            let slot = workflow
                .step_by_id_mut(step_id)
                .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
            if !synthetic {
                slot.user_input = Some(input.to_string());
            }
            for (key, value) in &outcome.collected {
                slot.state
                    .collected_information
                    .insert(key.clone(), value.clone());
            }
            if let Some(template) = &outcome.selected_template {
                slot.state.selected_template = Some(template.clone());
            }
            if let Some(verdict) = outcome.review_verdict {
                slot.state.review_verdict = Some(verdict);
            }
            if let Some(asset) = &outcome.generated_asset {
                slot.state.generated_asset = Some(asset.clone());
            }
            if let Some(suggestion) = &outcome.ai_suggestion {
                slot.ai_suggestion = Some(suggestion.clone());
            }
            let snapshot = slot.clone();
            self.store.update_step(&snapshot).await?;
        }

        if let Some(reply) = &outcome.reply {
            self.state
                .emit_once(&workflow.thread_id, reply, MessageRole::Assistant)
                .await?;
        }

        if outcome.mark_failed {
            self.state
                .finish_step(workflow, step_id, StepStatus::Failed)
                .await?;
            return Ok(CascadeOutcome {
                text: outcome.reply,
                ..Default::default()
            });
        }

        if !outcome.step_complete {
            return Ok(CascadeOutcome {
                text: outcome.reply,
                ..Default::default()
            });
        }

        self.state
            .finish_step(workflow, step_id, StepStatus::Complete)
            .await?;
        let inner = self.advance_and_cascade(workflow, chunks, depth).await?;

        // カスケードが前進した場合はその最終結果を優先する
        let text = if inner.steps_advanced > 0 || inner.workflow_completed {
            inner.text.or(outcome.reply)
        } else {
            outcome.reply.or(inner.text)
        };
        Ok(CascadeOutcome {
            text,
            steps_advanced: inner.steps_advanced + 1,
            workflow_completed: inner.workflow_completed,
            transitioned_to: inner.transitioned_to,
        })
    }

    /// 再帰用のボックス化版（`process_step` ⇄ カスケードの相互再帰を解く）
    pub(crate) fn process_step_boxed<'a>(
        &'a self,
        workflow: &'a mut WorkflowInstance,
        step_id: &'a str,
        input: &'a str,
        chunks: Option<mpsc::Sender<String>>,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Result<CascadeOutcome, EngineError>> + Send + 'a>> {
        Box::pin(self.process_step(workflow, step_id, input, chunks, depth))
    }
}
