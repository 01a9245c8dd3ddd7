//! エンジンの入出力型
//!
//! # 責務
//!
//! - 分類プロトコルの判定結果 [`Verdict`]
//! - ステップハンドラーの処理結果 [`StepOutcome`]
//! - 次ステップ選択の結果 [`NextStep`]
//! - エンジン呼び出し全体の応答 [`EngineResponse`]

use serde_json::{Map, Value};

use crate::model::{ReviewVerdict, StepInstance};

/// 分類プロトコルの判定結果
///
/// 補完サービスから返る JSON を共通の型に正規化したもの。
/// パース不能・タイムアウト時もフォールバックでこの型に変換されるため、
/// 分類経路で `Err` になることはありません。
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    /// ステップが完了したと判定されたか
    pub is_step_complete: bool,
    /// 会話全体から抽出された収集情報（累積）
    pub collected_information: Map<String, Value>,
    /// ユーザーへ返す次の質問・応答文
    pub next_question: Option<String>,
    /// 提案された次ステップ名（現状は記録のみ）
    pub suggested_next_step: Option<String>,
    /// 生成に進む準備ができているか
    pub ready_to_generate: bool,
    /// 判定モード（"collecting" / "ready" / "fallback" 等、診断用）
    pub mode: Option<String>,
}

/// ステップハンドラーの処理結果
///
/// ハンドラーは失敗を自身で会話的な応答に変換するため、
/// この型が持つのは「ステップがどうなったか」だけです。
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// ステップが完了したか
    pub step_complete: bool,
    /// ユーザーへ返す応答文（None なら無発話）
    pub reply: Option<String>,
    /// 今回追加で収集された情報（既存の収集情報にマージされる）
    pub collected: Map<String, Value>,
    /// 解決済みの選択先テンプレート名（Selection のみ）
    pub selected_template: Option<String>,
    /// レビュー判定（Review のみ）
    pub review_verdict: Option<ReviewVerdict>,
    /// 生成されたアセット（Generation / Review の修正版生成）
    pub generated_asset: Option<String>,
    /// AI による提案・補助出力（Utility 等）
    pub ai_suggestion: Option<String>,
    /// 回復不能な失敗としてステップを FAILED にするか
    pub mark_failed: bool,
}

impl StepOutcome {
    /// ステップを継続し、応答文を返す
    pub fn stay(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Default::default()
        }
    }

    /// ステップを完了する
    pub fn complete() -> Self {
        Self {
            step_complete: true,
            ..Default::default()
        }
    }

    /// 回復不能な失敗
    pub fn failed(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            mark_failed: true,
            ..Default::default()
        }
    }
}

/// 次ステップ選択の結果
#[derive(Debug, Clone)]
pub enum NextStep {
    /// 次に実行すべきステップ
    Step(StepInstance),
    /// すべてのステップが完了した
    WorkflowComplete,
    /// 実行可能なステップがないのに未完了ステップが残っている
    /// （依存の壊れ・FAILED による詰まり）
    Inconsistent {
        /// 残っている未完了ステップ名
        pending: Vec<String>,
    },
}

/// エンジン呼び出し全体の応答
#[derive(Debug, Clone, Default)]
pub struct EngineResponse {
    /// ユーザーへ返す最終的な応答文
    pub text: String,
    /// 処理対象となったワークフロー ID
    pub workflow_id: String,
    /// この呼び出しでワークフローが完了したか
    pub workflow_completed: bool,
    /// ワークフロー遷移で新たに開始されたワークフロー ID
    pub transitioned_to: Option<String>,
    /// この呼び出しで完了したステップ数（カスケード含む）
    pub steps_advanced: u32,
}
