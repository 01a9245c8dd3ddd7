//! 永続化コラボレーターのインターフェース
//!
//! # 責務
//!
//! - ワークフロー/ステップレコードの作成・読み出し・更新を行う
//!   [`WorkflowStore`] トレイトを定義
//! - テスト・CLI シミュレーション用のインメモリ実装 [`MemoryStore`] を提供
//!
//! # 設計
//!
//! ストアの操作はすべて不透明な文字列 ID をキーとします。
//! スキーマの詳細はストア実装の関心事であり、エンジンは要求しません。
//! ステップをまたぐ原子性は提供されません。各書き込みは独立して
//! コミットされます。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::error::StoreError;
use crate::model::{
    StepDefinition, StepInstance, StepStatus, WorkflowInstance, WorkflowStatus,
};

/// 新規ワークフローの作成パラメータ
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    /// 会話スレッド ID
    pub thread_id: String,
    /// 元になるテンプレートの ID
    pub template_id: String,
    /// 元になるテンプレートの名前
    pub template_name: String,
}

/// 永続化コラボレーターの契約
///
/// エンジンはこのトレイト越しにのみワークフロー/ステップレコードへ
/// アクセスします。実装は SQL・KVS・インメモリなど自由です。
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// ワークフローレコードを作成（ステータス ACTIVE、現在ステップなし）
    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowInstance, StoreError>;

    /// ワークフローをステップ込みで取得
    async fn get_workflow(&self, id: &str) -> Result<WorkflowInstance, StoreError>;

    /// スレッドに紐づくワークフローを作成時刻の昇順で取得
    async fn workflows_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// ワークフローのステータスを更新
    async fn update_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<(), StoreError>;

    /// 現在のステップ ID を更新（完了時は None）
    async fn update_current_step(
        &self,
        id: &str,
        step_id: Option<&str>,
    ) -> Result<(), StoreError>;

    /// ステップ定義からステップレコードを作成
    async fn create_step(
        &self,
        workflow_id: &str,
        definition: &StepDefinition,
        status: StepStatus,
    ) -> Result<StepInstance, StoreError>;

    /// ステップを取得
    async fn get_step(&self, workflow_id: &str, step_id: &str)
    -> Result<StepInstance, StoreError>;

    /// ステップ全体を上書き保存
    async fn update_step(&self, step: &StepInstance) -> Result<(), StoreError>;

    /// ステップを削除
    async fn delete_step(&self, workflow_id: &str, step_id: &str) -> Result<(), StoreError>;
}

/// インメモリのストア実装
///
/// 単一プロセス内での実行（テスト、CLI シミュレーション）を想定した
/// 参照実装です。ID は連番で払い出します。
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<String, WorkflowInstance>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// 空のストアを生成
    pub fn new() -> Self {
        Self::default()
    }

    fn issue_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkflowInstance>> {
        self.workflows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowInstance, StoreError> {
        let workflow = WorkflowInstance {
            id: self.issue_id("wf"),
            thread_id: new.thread_id,
            template_id: new.template_id,
            template_name: new.template_name,
            status: WorkflowStatus::Active,
            current_step_id: None,
            created_at: SystemTime::now(),
            steps: Vec::new(),
        };
        self.lock().insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowInstance, StoreError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))
    }

    async fn workflows_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut found: Vec<WorkflowInstance> = self
            .lock()
            .values()
            .filter(|w| w.thread_id == thread_id)
            .cloned()
            .collect();
        found.sort_by_key(|w| w.created_at);
        Ok(found)
    }

    async fn update_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let mut workflows = self.lock();
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        workflow.status = status;
        Ok(())
    }

    async fn update_current_step(
        &self,
        id: &str,
        step_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.lock();
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        workflow.current_step_id = step_id.map(|s| s.to_string());
        Ok(())
    }

    async fn create_step(
        &self,
        workflow_id: &str,
        definition: &StepDefinition,
        status: StepStatus,
    ) -> Result<StepInstance, StoreError> {
        let step = StepInstance {
            id: self.issue_id("step"),
            workflow_id: workflow_id.to_string(),
            name: definition.name.clone(),
            step_type: definition.step_type,
            role: definition.role,
            order: definition.order,
            status,
            dependencies: definition.dependencies.clone(),
            prompt: definition.prompt.clone(),
            user_input: None,
            ai_suggestion: None,
            config: definition.config.clone(),
            state: Default::default(),
        };
        let mut workflows = self.lock();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        workflow.steps.push(step.clone());
        workflow.steps.sort_by_key(|s| s.order);
        Ok(step)
    }

    async fn get_step(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<StepInstance, StoreError> {
        let workflows = self.lock();
        let workflow = workflows
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        workflow
            .step_by_id(step_id)
            .cloned()
            .ok_or_else(|| StoreError::StepNotFound(step_id.to_string()))
    }

    async fn update_step(&self, step: &StepInstance) -> Result<(), StoreError> {
        let mut workflows = self.lock();
        let workflow = workflows
            .get_mut(&step.workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(step.workflow_id.clone()))?;
        let slot = workflow
            .step_by_id_mut(&step.id)
            .ok_or_else(|| StoreError::StepNotFound(step.id.clone()))?;
        *slot = step.clone();
        Ok(())
    }

    async fn delete_step(&self, workflow_id: &str, step_id: &str) -> Result<(), StoreError> {
        let mut workflows = self.lock();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let before = workflow.steps.len();
        workflow.steps.retain(|s| s.id != step_id);
        if workflow.steps.len() == before {
            return Err(StoreError::StepNotFound(step_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StepConfig, StepRole, StepType};

    fn definition(name: &str, order: u32) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            step_type: StepType::JsonDialog,
            role: StepRole::Collection,
            order,
            dependencies: vec![],
            prompt: None,
            config: StepConfig::default(),
        }
    }

    fn new_workflow(thread: &str) -> NewWorkflow {
        NewWorkflow {
            thread_id: thread.to_string(),
            template_id: "tpl".to_string(),
            template_name: "Template".to_string(),
        }
    }

    /// ワークフロー作成と取得
    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let store = MemoryStore::new();
        let created = store.create_workflow(new_workflow("th-1")).await.unwrap();
        assert_eq!(created.status, WorkflowStatus::Active);
        assert!(created.current_step_id.is_none());

        let loaded = store.get_workflow(&created.id).await.unwrap();
        assert_eq!(loaded.thread_id, "th-1");
    }

    /// ステップは order 昇順で保持される
    #[tokio::test]
    async fn test_steps_sorted_by_order() {
        let store = MemoryStore::new();
        let wf = store.create_workflow(new_workflow("th-1")).await.unwrap();
        store
            .create_step(&wf.id, &definition("b", 2), StepStatus::Pending)
            .await
            .unwrap();
        store
            .create_step(&wf.id, &definition("a", 1), StepStatus::InProgress)
            .await
            .unwrap();

        let loaded = store.get_workflow(&wf.id).await.unwrap();
        let names: Vec<&str> = loaded.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    /// スレッド検索は作成順で返る
    #[tokio::test]
    async fn test_workflows_by_thread() {
        let store = MemoryStore::new();
        let first = store.create_workflow(new_workflow("th-1")).await.unwrap();
        let second = store.create_workflow(new_workflow("th-1")).await.unwrap();
        store.create_workflow(new_workflow("th-2")).await.unwrap();

        let found = store.workflows_by_thread("th-1").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, first.id);
        assert_eq!(found[1].id, second.id);
    }

    /// ステップ更新は全体上書き
    #[tokio::test]
    async fn test_update_step() {
        let store = MemoryStore::new();
        let wf = store.create_workflow(new_workflow("th-1")).await.unwrap();
        let mut step = store
            .create_step(&wf.id, &definition("a", 1), StepStatus::InProgress)
            .await
            .unwrap();

        step.status = StepStatus::Complete;
        step.user_input = Some("hello".to_string());
        store.update_step(&step).await.unwrap();

        let loaded = store.get_step(&wf.id, &step.id).await.unwrap();
        assert_eq!(loaded.status, StepStatus::Complete);
        assert_eq!(loaded.user_input.as_deref(), Some("hello"));
    }

    /// 存在しない ID はエラー
    #[tokio::test]
    async fn test_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_workflow("missing").await,
            Err(StoreError::WorkflowNotFound(_))
        ));
    }
}
