//! コアデータモデルの定義
//!
//! # 責務
//!
//! - ワークフローテンプレート（不変の定義）とワークフローインスタンス
//!   （実行中の状態）の型を提供
//! - ステップの構造的設定 [`StepConfig`]（テンプレート由来・不変）と
//!   実行時状態 [`StepRuntimeState`]（インスタンス所有・可変）を分離
//! - ステータス遷移の正当性チェック（単調性）を提供
//!
//! # 主要な型
//!
//! - [`WorkflowTemplate`] / [`StepDefinition`]: 不変のテンプレート定義
//! - [`WorkflowInstance`] / [`StepInstance`]: スレッドごとの実行状態
//! - [`StepStatus`] / [`WorkflowStatus`]: 状態機械のステータス
//! - [`StepRole`]: ステップハンドラーを選択する役割（名前ベースの
//!   ディスパッチを避けるための明示的なフィールド）

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;

/// ステップの種類
///
/// ステップがどのような処理単位かを表します。ヘッドレス実行
/// （ユーザー入力なしの自動実行）が可能かどうかの判定に使われます。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// JSON プロトコルによる対話型の情報収集
    JsonDialog,
    /// 外部 API 呼び出し
    ApiCall,
    /// スレッドタイトルの自動生成
    GenerateThreadTitle,
    /// コンテンツ（アセット）の生成
    AssetCreation,
    /// AI による提案の生成
    AiSuggestion,
    /// 自由形式のユーザー入力
    UserInput,
    /// データ変換
    DataTransformation,
}

impl StepType {
    /// ヘッドレス（ユーザー入力なし）で実行可能か
    ///
    /// 自動実行カスケードは、この判定が真のステップのみを対象とします。
    pub fn supports_headless(&self) -> bool {
        matches!(
            self,
            StepType::ApiCall
                | StepType::GenerateThreadTitle
                | StepType::AssetCreation
                | StepType::AiSuggestion
                | StepType::DataTransformation
        )
    }
}

/// ステップの役割
///
/// どのステップハンドラーで処理するかを決定します。
/// ステップ名の文字列マッチではなく、テンプレート定義上の
/// 明示的なフィールドで選択されます。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    /// 次に実行するワークフローの選択
    Selection,
    /// 情報収集（既定）
    #[default]
    Collection,
    /// 生成物のレビュー（承認・修正依頼の判定）
    Review,
    /// コンテンツ生成
    Generation,
    /// 補助的なヘッドレス処理（タイトル生成など）
    Utility,
}

/// ステップのステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// 未着手
    Pending,
    /// 実行中
    InProgress,
    /// 完了
    Complete,
    /// 失敗（回復不能な失敗時のみ）
    Failed,
}

impl StepStatus {
    /// 終端状態（Complete / Failed）かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Failed)
    }

    /// 前進遷移として正当かどうか
    ///
    /// `Pending → InProgress → {Complete, Failed}` のみ正当。
    /// 終端状態から `Pending` への後退は明示的なロールバック操作
    /// でのみ許可されるため、ここでは正当と見なしません。
    pub fn can_advance_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Complete)
                | (StepStatus::InProgress, StepStatus::Failed)
        )
    }
}

/// ワークフローのステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// 実行中
    Active,
    /// 完了（終端。以後の遷移はなし）
    Completed,
}

/// ステップの構造的設定（テンプレート由来・不変）
///
/// テンプレートの編集が実行中のワークフローに反映されるのは
/// このフィールド群のみです（[`WorkflowInstance`] 読み出し時に再マージ）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepConfig {
    /// 必須フィールド（重み 0.7）
    pub essential: Vec<String>,
    /// 重要フィールド（重み 0.2）
    pub important: Vec<String>,
    /// 任意フィールド（重み 0.1）
    pub optional: Vec<String>,
    /// ステップの目的（分類プロンプトに埋め込まれる）
    pub goal: Option<String>,
    /// 分類プロンプトの基本指示
    pub base_instructions: Option<String>,
    /// ユーザー入力を待たずに自動実行するか
    pub auto_execute: bool,
    /// テンプレート固有の追加設定
    pub extra: Map<String, Value>,
}

impl StepConfig {
    /// フィールド階層が一切設定されていないか
    pub fn has_no_fields(&self) -> bool {
        self.essential.is_empty() && self.important.is_empty() && self.optional.is_empty()
    }
}

/// レビューステップの判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    /// 承認された
    Approved,
    /// 修正が要求された
    RevisionRequested,
    /// 修正版を生成済み
    RevisionGenerated,
    /// 意図が不明
    Unclear,
    /// 別のワークフローへの切り替え要求
    CrossWorkflowRequest,
}

/// ステップの実行時状態（インスタンス所有・可変）
///
/// ストアに保存された値が常に優先され、テンプレートの再マージで
/// 上書きされることはありません。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepRuntimeState {
    /// これまでに収集した情報（後続ステップへ伝播する）
    pub collected_information: Map<String, Value>,
    /// 初回プロンプトを送信済みか（重複送信防止）
    pub initial_prompt_sent: bool,
    /// 生成されたアセット（Generation ステップのみ）
    pub generated_asset: Option<String>,
    /// 解決済みの選択先テンプレート名（Selection ステップのみ）
    pub selected_template: Option<String>,
    /// レビュー判定（Review ステップのみ）
    pub review_verdict: Option<ReviewVerdict>,
    /// ステップ固有の作業状態
    pub extra: Map<String, Value>,
}

/// ステップ定義（テンプレートの一部・不変）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// ステップ名（ワークフロー内で一意）
    pub name: String,
    /// ステップの種類
    pub step_type: StepType,
    /// ハンドラー選択用の役割
    #[serde(default)]
    pub role: StepRole,
    /// 実行順序（ワークフロー内で一意・昇順）
    pub order: u32,
    /// 依存するステップ名のリスト（同一ワークフロー内）
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// ステップ開始時にユーザーへ送るプロンプト
    #[serde(default)]
    pub prompt: Option<String>,
    /// 構造的設定
    #[serde(default)]
    pub config: StepConfig,
}

/// ワークフローテンプレート（不変・順序付きステップ定義のリスト）
///
/// 同一性のみでバージョン管理されます。実行中のインスタンスは作成時に
/// ステップ定義をスナップショットしますが、[`StepConfig`] は読み出し時に
/// 再マージされます。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    /// テンプレート ID（不透明な文字列）
    pub id: String,
    /// テンプレート名
    pub name: String,
    /// 説明
    #[serde(default)]
    pub description: Option<String>,
    /// 順序付きステップ定義
    pub steps: Vec<StepDefinition>,
}

impl WorkflowTemplate {
    /// ステップ定義を名前で取得
    pub fn step_by_name(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Selection 役割のステップを持つか（セレクターテンプレートか）
    pub fn is_selector(&self) -> bool {
        self.steps.iter().any(|s| s.role == StepRole::Selection)
    }

    /// テンプレートの構造を検証
    ///
    /// # 検証内容
    ///
    /// 1. ステップが 1 つ以上存在する
    /// 2. ステップ名が一意
    /// 3. `order` が一意かつ狭義単調増加
    /// 4. 依存先の名前が同一テンプレート内に存在する
    /// 5. 依存グラフが非巡回（自動実行ステップの循環もここで排除される）
    ///
    /// # 戻り値
    ///
    /// * `Ok(())` - 検証に成功した場合
    /// * `Err(ConfigError::Validation)` - 構造が不正な場合
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if self.steps.is_empty() {
            return Err(ConfigError::Validation(format!(
                "テンプレート '{}' にステップがありません",
                self.name
            )));
        }

        let mut last_order: Option<u32> = None;
        for step in &self.steps {
            if self.steps.iter().filter(|s| s.name == step.name).count() > 1 {
                return Err(ConfigError::Validation(format!(
                    "ステップ名 '{}' が重複しています",
                    step.name
                )));
            }
            if let Some(prev) = last_order {
                if step.order <= prev {
                    return Err(ConfigError::Validation(format!(
                        "ステップ '{}' の order ({}) が昇順ではありません",
                        step.name, step.order
                    )));
                }
            }
            last_order = Some(step.order);

            for dep in &step.dependencies {
                if self.step_by_name(dep).is_none() {
                    return Err(ConfigError::Validation(format!(
                        "ステップ '{}' の依存先 '{}' が存在しません",
                        step.name, dep
                    )));
                }
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// 依存グラフが非巡回であることを確認（DFS による循環検出）
    fn check_acyclic(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        // 0 = 未訪問, 1 = 訪問中, 2 = 訪問済み
        let mut mark: std::collections::HashMap<&str, u8> = std::collections::HashMap::new();

        fn visit<'a>(
            template: &'a WorkflowTemplate,
            name: &'a str,
            mark: &mut std::collections::HashMap<&'a str, u8>,
        ) -> Result<(), String> {
            match mark.get(name) {
                Some(1) => return Err(name.to_string()),
                Some(2) => return Ok(()),
                _ => {}
            }
            mark.insert(name, 1);
            if let Some(step) = template.step_by_name(name) {
                for dep in &step.dependencies {
                    visit(template, dep, mark)?;
                }
            }
            mark.insert(name, 2);
            Ok(())
        }

        for step in &self.steps {
            visit(self, &step.name, &mut mark).map_err(|cycle_at| {
                ConfigError::Validation(format!(
                    "依存グラフに循環があります（'{cycle_at}' 付近）"
                ))
            })?;
        }
        Ok(())
    }
}

/// ステップインスタンス（実行中のステップ）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInstance {
    /// ステップ ID（不透明な文字列）
    pub id: String,
    /// 所属するワークフロー ID
    pub workflow_id: String,
    /// ステップ名
    pub name: String,
    /// ステップの種類
    pub step_type: StepType,
    /// ハンドラー選択用の役割
    pub role: StepRole,
    /// 実行順序
    pub order: u32,
    /// ステータス
    pub status: StepStatus,
    /// 依存するステップ名
    pub dependencies: Vec<String>,
    /// ステップ開始時のプロンプト
    pub prompt: Option<String>,
    /// 最後のユーザー入力
    pub user_input: Option<String>,
    /// AI による提案・生成物
    pub ai_suggestion: Option<String>,
    /// 構造的設定（読み出し時にテンプレートから再マージされる）
    pub config: StepConfig,
    /// 実行時状態（ストアの値が常に優先される）
    pub state: StepRuntimeState,
}

impl StepInstance {
    /// 文脈集約の対象となるデータを保持しているか
    pub fn has_collected_data(&self) -> bool {
        !self.state.collected_information.is_empty()
            || self.ai_suggestion.is_some()
            || self.user_input.is_some()
    }
}

/// ワークフローインスタンス（1 スレッド上の 1 実行）
///
/// 不変条件: 1 スレッドにつきアクティブなインスタンスは高々 1 つ。
/// 違反が検出された場合は最新作成のものを正とし、警告ログを残します。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    /// ワークフロー ID（不透明な文字列）
    pub id: String,
    /// 会話スレッド ID
    pub thread_id: String,
    /// 元になったテンプレートの ID
    pub template_id: String,
    /// 元になったテンプレートの名前
    pub template_name: String,
    /// ステータス
    pub status: WorkflowStatus,
    /// 現在実行中のステップ ID（完了時は None）
    pub current_step_id: Option<String>,
    /// 作成時刻（複数アクティブ時の新しさ判定に使用）
    pub created_at: SystemTime,
    /// ステップインスタンス（order 昇順）
    pub steps: Vec<StepInstance>,
}

impl WorkflowInstance {
    /// ステップを ID で取得
    pub fn step_by_id(&self, step_id: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// ステップを名前で取得
    pub fn step_by_name(&self, name: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// ステップを ID で可変参照として取得
    pub fn step_by_id_mut(&mut self, step_id: &str) -> Option<&mut StepInstance> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// 現在実行中のステップを取得
    pub fn current_step(&self) -> Option<&StepInstance> {
        self.current_step_id
            .as_deref()
            .and_then(|id| self.step_by_id(id))
    }

    /// すべてのステップが完了しているか
    pub fn all_steps_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Complete)
    }

    /// アクティブかどうか
    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Selection 役割のステップを取得（セレクターワークフローの判定用）
    pub fn selection_step(&self) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.role == StepRole::Selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, order: u32, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            step_type: StepType::JsonDialog,
            role: StepRole::Collection,
            order,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            prompt: None,
            config: StepConfig::default(),
        }
    }

    fn template(steps: Vec<StepDefinition>) -> WorkflowTemplate {
        WorkflowTemplate {
            id: "tpl-1".to_string(),
            name: "test".to_string(),
            description: None,
            steps,
        }
    }

    /// 正常なテンプレートはバリデーションに成功する
    #[test]
    fn test_validate_ok() {
        let tpl = template(vec![
            step("a", 1, &[]),
            step("b", 2, &["a"]),
            step("c", 3, &["b"]),
        ]);
        assert!(tpl.validate().is_ok());
    }

    /// order が昇順でない場合はエラー
    #[test]
    fn test_validate_rejects_non_increasing_order() {
        let tpl = template(vec![step("a", 2, &[]), step("b", 1, &[])]);
        assert!(tpl.validate().is_err());
    }

    /// order の重複はエラー
    #[test]
    fn test_validate_rejects_duplicate_order() {
        let tpl = template(vec![step("a", 1, &[]), step("b", 1, &[])]);
        assert!(tpl.validate().is_err());
    }

    /// 存在しない依存先はエラー
    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let tpl = template(vec![step("a", 1, &["ghost"])]);
        assert!(tpl.validate().is_err());
    }

    /// 依存グラフの循環はエラー
    #[test]
    fn test_validate_rejects_cycle() {
        let tpl = template(vec![step("a", 1, &["b"]), step("b", 2, &["a"])]);
        assert!(tpl.validate().is_err());
    }

    /// ステップなしのテンプレートはエラー
    #[test]
    fn test_validate_rejects_empty() {
        let tpl = template(vec![]);
        assert!(tpl.validate().is_err());
    }

    /// ステータスの前進遷移の正当性
    #[test]
    fn test_step_status_can_advance() {
        assert!(StepStatus::Pending.can_advance_to(StepStatus::InProgress));
        assert!(StepStatus::InProgress.can_advance_to(StepStatus::Complete));
        assert!(StepStatus::InProgress.can_advance_to(StepStatus::Failed));
        // 後退遷移は不正（ロールバックは別操作）
        assert!(!StepStatus::Complete.can_advance_to(StepStatus::Pending));
        assert!(!StepStatus::Complete.can_advance_to(StepStatus::InProgress));
        assert!(!StepStatus::Pending.can_advance_to(StepStatus::Complete));
    }

    /// ヘッドレス実行可能な種類の判定
    #[test]
    fn test_step_type_supports_headless() {
        assert!(StepType::GenerateThreadTitle.supports_headless());
        assert!(StepType::ApiCall.supports_headless());
        assert!(!StepType::JsonDialog.supports_headless());
        assert!(!StepType::UserInput.supports_headless());
    }

    /// セレクター判定は Selection 役割の有無で決まる
    #[test]
    fn test_is_selector() {
        let mut tpl = template(vec![step("select", 1, &[])]);
        assert!(!tpl.is_selector());
        tpl.steps[0].role = StepRole::Selection;
        assert!(tpl.is_selector());
    }

    /// SCREAMING_SNAKE_CASE でシリアライズされる
    #[test]
    fn test_step_type_serde_shape() {
        let json = serde_json::to_string(&StepType::JsonDialog).unwrap();
        assert_eq!(json, "\"JSON_DIALOG\"");
        let back: StepType = serde_json::from_str("\"GENERATE_THREAD_TITLE\"").unwrap();
        assert_eq!(back, StepType::GenerateThreadTitle);
    }
}
