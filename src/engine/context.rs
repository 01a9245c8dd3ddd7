//! ワークフロー文脈の集約と注入
//!
//! # 責務
//!
//! - 先行ステップの出力を後続ステップが参照できる形に集約する
//! - ステップ開始時に集約済み文脈を実行時状態へ注入する
//!
//! # 集約の形
//!
//! データを持つ各ステップは正規化したステップ名をキーとしてエントリーを持ち、
//! 収集情報・ユーザー入力・AI 出力を含みます。加えて、役割や名前から
//! 導ける代表的な値はトップレベルの意味キー（`selectedWorkflow` 等）
//! にも展開され、後続のプロンプト構築から直接参照できます。
//! 後のステップのエントリーが先のステップと同じ意味キーを持つ場合は
//! 後勝ちです。

use serde_json::{Map, Value};

use crate::model::{StepInstance, StepRole, StepStatus, WorkflowInstance};

/// ステップ名を文脈キーへ正規化（小文字化・空白除去）
pub fn normalized_step_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// ステップの代表値を取り出す
///
/// 選択結果 → AI 出力 → ユーザー入力の順で採用します。
fn representative_value(step: &StepInstance) -> Option<String> {
    step.state
        .selected_template
        .clone()
        .or_else(|| step.ai_suggestion.clone())
        .or_else(|| step.user_input.clone())
}

/// ステップの出力から文脈を集約
///
/// 完了済みか否かにかかわらず、データを持つステップはすべて対象です
/// （実行中のステップが途中まで集めた情報も後続の判定に使える）。
///
/// # 戻り値
///
/// 正規化ステップ名ごとのエントリーと、意味キーを含む 1 つのマップ。
/// データを持たないステップはエントリーを作りません。
pub fn gather_context(workflow: &WorkflowInstance) -> Map<String, Value> {
    let mut context = Map::new();

    for step in &workflow.steps {
        if !step.has_collected_data() {
            continue;
        }

        let mut entry = Map::new();
        if !step.state.collected_information.is_empty() {
            entry.insert(
                "collectedInformation".to_string(),
                Value::Object(step.state.collected_information.clone()),
            );
        }
        if let Some(input) = &step.user_input {
            entry.insert("userInput".to_string(), Value::String(input.clone()));
        }
        if let Some(suggestion) = &step.ai_suggestion {
            entry.insert("aiSuggestion".to_string(), Value::String(suggestion.clone()));
        }
        if let Some(asset) = &step.state.generated_asset {
            entry.insert("generatedAsset".to_string(), Value::String(asset.clone()));
        }
        context.insert(normalized_step_key(&step.name), Value::Object(entry));

        // 意味キーへの展開（後勝ち）
        if let Some(value) = representative_value(step) {
            if step.role == StepRole::Selection {
                context.insert("selectedWorkflow".to_string(), Value::String(value.clone()));
            }
            let key = normalized_step_key(&step.name);
            if key.contains("announcementtype") {
                context.insert("announcementType".to_string(), Value::String(value.clone()));
            }
            if key.contains("assettype") {
                context.insert("assetType".to_string(), Value::String(value));
            }
        }

        // 収集情報のフィールドもトップレベルに展開する（後勝ち）。
        // 後続ステップの充足判定が前段の回答を再質問しないための措置。
        for (k, v) in &step.state.collected_information {
            context.insert(k.clone(), v.clone());
        }
    }

    context
}

/// ステップ開始時に文脈を実行時状態へ注入
///
/// 集約済み文脈のトップレベルのスカラー値を収集情報として引き継ぎます
/// （ステップ自身がすでに持つキーは上書きしない）。全体は作業状態の
/// `workflowContext` に保存され、プロンプト構築から参照されます。
pub fn initialize_step_with_context(step: &mut StepInstance, context: &Map<String, Value>) {
    for (key, value) in context {
        if value.is_object() {
            continue;
        }
        step.state
            .collected_information
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    step.state
        .extra
        .insert("workflowContext".to_string(), Value::Object(context.clone()));
}
