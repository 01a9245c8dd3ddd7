//! 役割ベースのステップハンドラー
//!
//! # 責務
//!
//! - [`StepRole`] ごとの処理を [`StepHandler`] トレイトとして定義
//! - 役割からハンドラーへのディスパッチを提供
//!
//! ハンドラーは補完サービスの失敗を自身で会話的な応答に変換します。
//! 回復不能な失敗（レビュー対象のアセット不在など）のみ
//! `mark_failed` でステップを FAILED にします。

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::model::{ReviewVerdict, StepInstance, StepRole, StepType};
use crate::provider::ModelTier;
use crate::registry::TemplateRegistry;
use crate::transport::ThreadMessage;

use super::classifier::CompletionClassifier;
use super::result::StepOutcome;

/// 生成失敗時の定型応答
pub const GENERATION_FAILURE_FALLBACK: &str =
    "申し訳ありません、生成処理に失敗しました。もう一度お試しください。";

/// レビュー意図が不明な場合の聞き返し
const REVIEW_UNCLEAR_REPLY: &str =
    "この内容でよろしいですか？「承認」または修正したい点をお知らせください。";

/// ハンドラーが参照するコラボレーター
pub struct HandlerDeps<'a> {
    pub classifier: &'a CompletionClassifier,
    pub registry: &'a TemplateRegistry,
    /// ストリーミング応答用のチャネル（生成系ハンドラーのみ使用）
    pub chunks: Option<mpsc::Sender<String>>,
}

/// ステップハンドラーの契約
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(
        &self,
        step: &StepInstance,
        input: &str,
        history: &[ThreadMessage],
        deps: &HandlerDeps<'_>,
    ) -> StepOutcome;
}

/// 役割からハンドラーを選択
pub fn handler_for(role: StepRole) -> &'static dyn StepHandler {
    match role {
        StepRole::Selection => &SelectionHandler,
        StepRole::Collection => &CollectionHandler,
        StepRole::Review => &ReviewHandler,
        StepRole::Generation => &GenerationHandler,
        StepRole::Utility => &UtilityHandler,
    }
}

/// 集約済み文脈（activate 時に注入されたもの）を取り出す
fn workflow_context(step: &StepInstance) -> Map<String, Value> {
    step.state
        .extra
        .get("workflowContext")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// 文脈からレビュー/修正対象のアセットを探す
fn find_generated_asset(step: &StepInstance) -> Option<String> {
    if let Some(asset) = &step.state.generated_asset {
        return Some(asset.clone());
    }
    for value in workflow_context(step).values() {
        if let Some(asset) = value.get("generatedAsset").and_then(Value::as_str) {
            return Some(asset.to_string());
        }
    }
    None
}

/// 情報収集ハンドラー（既定）
///
/// 完了分類プロトコルをそのまま適用します。
pub struct CollectionHandler;

#[async_trait]
impl StepHandler for CollectionHandler {
    async fn handle(
        &self,
        step: &StepInstance,
        input: &str,
        history: &[ThreadMessage],
        deps: &HandlerDeps<'_>,
    ) -> StepOutcome {
        let verdict = deps.classifier.classify(step, input, history).await;
        StepOutcome {
            step_complete: verdict.is_step_complete,
            reply: verdict.next_question,
            collected: verdict.collected_information,
            ..Default::default()
        }
    }
}

/// ワークフロー選択ハンドラー
///
/// ユーザーの選択をレジストリに対して解決し、正規のテンプレート名を
/// 記録します。解決はこの時点ではあいまい照合を許容します
/// （遷移時の照合は完全一致のみ）。
pub struct SelectionHandler;

#[async_trait]
impl StepHandler for SelectionHandler {
    async fn handle(
        &self,
        step: &StepInstance,
        input: &str,
        history: &[ThreadMessage],
        deps: &HandlerDeps<'_>,
    ) -> StepOutcome {
        let verdict = deps.classifier.classify(step, input, history).await;

        // 分類が抽出した選択値 → 提案 → 生の入力の順で解決を試みる
        let candidates = [
            verdict
                .collected_information
                .get("selectedWorkflow")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            verdict.suggested_next_step.clone(),
            Some(input.trim().to_string()).filter(|s| !s.is_empty()),
        ];

        for candidate in candidates.into_iter().flatten() {
            if let Some(template) = deps.registry.resolve(&candidate) {
                tracing::info!(selected = %template.name, "workflow selected");
                return StepOutcome {
                    step_complete: true,
                    reply: Some(format!("「{}」を作成します。", template.name)),
                    collected: verdict.collected_information,
                    selected_template: Some(template.name),
                    ..Default::default()
                };
            }
        }

        // 解決できない場合は選択肢を提示して聞き返す
        let reply = verdict.next_question.unwrap_or_else(|| {
            let names: Vec<String> = deps
                .registry
                .list()
                .into_iter()
                .filter(|t| !t.is_selector())
                .map(|t| format!("- {}", t.name))
                .collect();
            format!(
                "どの種類を作成しますか？以下から選んでください:\n{}",
                names.join("\n")
            )
        });
        StepOutcome {
            step_complete: false,
            reply: Some(reply),
            collected: verdict.collected_information,
            ..Default::default()
        }
    }
}

/// コンテンツ生成ハンドラー
///
/// 集約済み文脈と収集情報からアセットを生成します。
/// ストリーミングチャネルが渡されていれば増分送出します。
pub struct GenerationHandler;

impl GenerationHandler {
    fn build_prompt(step: &StepInstance) -> (String, String) {
        let mut system = String::from(
            "You are a professional Japanese copywriter. \
             Produce the requested content directly, with no preamble and no markdown fences.\n",
        );
        if let Some(goal) = &step.config.goal {
            system.push_str(&format!("Goal: {goal}\n"));
        }
        if let Some(instructions) = &step.config.base_instructions {
            system.push_str(&format!("Instructions: {instructions}\n"));
        }

        let context = workflow_context(step);
        let collected = &step.state.collected_information;
        let user = format!(
            "Collected information (JSON):\n{}\n\nWorkflow context (JSON):\n{}\n\nGenerate the content now, in Japanese.",
            serde_json::to_string_pretty(&Value::Object(collected.clone()))
                .unwrap_or_else(|_| "{}".to_string()),
            serde_json::to_string_pretty(&Value::Object(context))
                .unwrap_or_else(|_| "{}".to_string()),
        );
        (system, user)
    }
}

#[async_trait]
impl StepHandler for GenerationHandler {
    async fn handle(
        &self,
        step: &StepInstance,
        _input: &str,
        _history: &[ThreadMessage],
        deps: &HandlerDeps<'_>,
    ) -> StepOutcome {
        let (system, user) = Self::build_prompt(step);
        match deps
            .classifier
            .generate_text(&system, &user, ModelTier::Heavy, deps.chunks.clone())
            .await
        {
            Ok(asset) => StepOutcome {
                step_complete: true,
                reply: Some(asset.clone()),
                generated_asset: Some(asset),
                ..Default::default()
            },
            Err(error) => {
                tracing::error!(step = %step.name, %error, "asset generation failed");
                StepOutcome::stay(GENERATION_FAILURE_FALLBACK)
            }
        }
    }
}

/// レビューハンドラー
///
/// 生成物に対するユーザーの反応を承認・修正依頼・不明・別ワークフロー
/// 要求に分類します。修正依頼の場合は修正版を生成して提示し、
/// ステップは継続します（承認で完了）。
pub struct ReviewHandler;

impl ReviewHandler {
    fn classification_prompt(asset: &str) -> String {
        format!(
            "You are reviewing a user's reaction to generated content.\n\
             The content under review:\n---\n{asset}\n---\n\
             Classify the user's latest message into exactly one verdict:\n\
             - \"approved\": the user accepts the content\n\
             - \"revision_requested\": the user wants changes\n\
             - \"cross_workflow_request\": the user asks for a different kind of deliverable\n\
             - \"unclear\": none of the above\n\
             Respond with ONLY a JSON object: \
             {{ \"verdict\": \"...\", \"requestedChanges\": \"string or null\" }}"
        )
    }

    fn parse_review(raw: &str) -> (ReviewVerdict, Option<String>) {
        let parsed = super::classifier::extract_json(raw)
            .and_then(|json| serde_json::from_str::<Value>(json).ok());
        let Some(obj) = parsed.as_ref().and_then(Value::as_object) else {
            return (ReviewVerdict::Unclear, None);
        };
        let verdict = match obj.get("verdict").and_then(Value::as_str) {
            Some("approved") => ReviewVerdict::Approved,
            Some("revision_requested") => ReviewVerdict::RevisionRequested,
            Some("cross_workflow_request") => ReviewVerdict::CrossWorkflowRequest,
            _ => ReviewVerdict::Unclear,
        };
        let changes = obj
            .get("requestedChanges")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        (verdict, changes)
    }

    async fn revise(
        asset: &str,
        changes: &str,
        step: &StepInstance,
        deps: &HandlerDeps<'_>,
    ) -> Result<String, crate::error::ProviderError> {
        let system = "You are a professional Japanese copywriter. \
                      Revise the given content according to the requested changes. \
                      Output only the full revised content."
            .to_string();
        let context = workflow_context(step);
        let user = format!(
            "Current content:\n---\n{asset}\n---\n\nRequested changes:\n{changes}\n\n\
             Workflow context (JSON):\n{}",
            serde_json::to_string_pretty(&Value::Object(context))
                .unwrap_or_else(|_| "{}".to_string()),
        );
        deps.classifier
            .generate_text(&system, &user, ModelTier::Heavy, deps.chunks.clone())
            .await
    }
}

#[async_trait]
impl StepHandler for ReviewHandler {
    async fn handle(
        &self,
        step: &StepInstance,
        input: &str,
        _history: &[ThreadMessage],
        deps: &HandlerDeps<'_>,
    ) -> StepOutcome {
        let Some(asset) = find_generated_asset(step) else {
            tracing::error!(step = %step.name, "no generated asset available for review");
            return StepOutcome {
                review_verdict: Some(ReviewVerdict::Unclear),
                ..StepOutcome::failed("レビュー対象の生成物が見つかりませんでした。")
            };
        };

        let system = Self::classification_prompt(&asset);
        let (verdict, changes) = match deps
            .classifier
            .generate_text(&system, input, ModelTier::Medium, None)
            .await
        {
            Ok(content) => Self::parse_review(&content),
            Err(error) => {
                tracing::warn!(step = %step.name, %error, "review classification failed");
                (ReviewVerdict::Unclear, None)
            }
        };

        match verdict {
            ReviewVerdict::Approved => StepOutcome {
                step_complete: true,
                reply: Some("承認ありがとうございます。この内容で確定します。".to_string()),
                review_verdict: Some(ReviewVerdict::Approved),
                ..Default::default()
            },
            ReviewVerdict::RevisionRequested => {
                let changes = changes.unwrap_or_else(|| input.to_string());
                match Self::revise(&asset, &changes, step, deps).await {
                    Ok(revised) => StepOutcome {
                        step_complete: false,
                        reply: Some(revised.clone()),
                        review_verdict: Some(ReviewVerdict::RevisionGenerated),
                        generated_asset: Some(revised),
                        ..Default::default()
                    },
                    Err(error) => {
                        tracing::error!(step = %step.name, %error, "revision generation failed");
                        StepOutcome {
                            review_verdict: Some(ReviewVerdict::RevisionRequested),
                            ..StepOutcome::stay(GENERATION_FAILURE_FALLBACK)
                        }
                    }
                }
            }
            ReviewVerdict::CrossWorkflowRequest => StepOutcome {
                step_complete: false,
                reply: Some(
                    "別の種類の作成をご希望のようです。現在の内容を承認いただくか、\
                     修正点をお知らせください。完了後に次の作成へ進めます。"
                        .to_string(),
                ),
                review_verdict: Some(ReviewVerdict::CrossWorkflowRequest),
                ..Default::default()
            },
            _ => StepOutcome {
                review_verdict: Some(ReviewVerdict::Unclear),
                ..StepOutcome::stay(REVIEW_UNCLEAR_REPLY)
            },
        }
    }
}

/// 補助処理ハンドラー
///
/// タイトル生成などの軽量なヘッドレス処理を 1 回の呼び出しで行います。
/// 応答はスレッドに送出せず、AI 出力として記録されるだけです。
pub struct UtilityHandler;

#[async_trait]
impl StepHandler for UtilityHandler {
    async fn handle(
        &self,
        step: &StepInstance,
        _input: &str,
        _history: &[ThreadMessage],
        deps: &HandlerDeps<'_>,
    ) -> StepOutcome {
        let mut system = String::from("You are a workflow utility assistant.\n");
        if step.step_type == StepType::GenerateThreadTitle {
            system.push_str(
                "Generate a concise Japanese title (at most 20 characters) for this conversation thread. \
                 Output only the title.\n",
            );
        } else if let Some(goal) = &step.config.goal {
            system.push_str(&format!("Goal: {goal}\nOutput only the result.\n"));
        }

        let context = workflow_context(step);
        let user = format!(
            "Workflow context (JSON):\n{}",
            serde_json::to_string_pretty(&Value::Object(context))
                .unwrap_or_else(|_| "{}".to_string()),
        );

        match deps
            .classifier
            .generate_text(&system, &user, ModelTier::Light, None)
            .await
        {
            Ok(output) => StepOutcome {
                step_complete: true,
                ai_suggestion: Some(output.trim().to_string()),
                ..Default::default()
            },
            Err(error) => {
                // 補助処理の失敗でワークフローを止めない
                tracing::warn!(step = %step.name, %error, "utility step failed, completing without output");
                StepOutcome::complete()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StepConfig, StepRuntimeState, StepStatus};

    fn review_step_with_asset(asset: Option<&str>) -> StepInstance {
        let mut state = StepRuntimeState::default();
        state.generated_asset = asset.map(|s| s.to_string());
        StepInstance {
            id: "step-1".to_string(),
            workflow_id: "wf-1".to_string(),
            name: "Review".to_string(),
            step_type: StepType::JsonDialog,
            role: StepRole::Review,
            order: 3,
            status: StepStatus::InProgress,
            dependencies: vec![],
            prompt: None,
            user_input: None,
            ai_suggestion: None,
            config: StepConfig::default(),
            state,
        }
    }

    /// レビュー判定 JSON のパース
    #[test]
    fn test_parse_review_verdicts() {
        let (v, c) = ReviewHandler::parse_review(
            r#"{ "verdict": "revision_requested", "requestedChanges": "短くして" }"#,
        );
        assert_eq!(v, ReviewVerdict::RevisionRequested);
        assert_eq!(c.as_deref(), Some("短くして"));

        let (v, _) = ReviewHandler::parse_review(r#"{ "verdict": "approved" }"#);
        assert_eq!(v, ReviewVerdict::Approved);

        let (v, _) = ReviewHandler::parse_review("not json");
        assert_eq!(v, ReviewVerdict::Unclear);
    }

    /// 文脈からのアセット探索（自身の状態が優先）
    #[test]
    fn test_find_generated_asset_own_state() {
        let step = review_step_with_asset(Some("ドラフト"));
        assert_eq!(find_generated_asset(&step).as_deref(), Some("ドラフト"));
    }

    /// 文脈エントリーからのアセット探索
    #[test]
    fn test_find_generated_asset_from_context() {
        let mut step = review_step_with_asset(None);
        let mut entry = Map::new();
        entry.insert(
            "generatedAsset".to_string(),
            Value::String("前段の生成物".to_string()),
        );
        let mut ctx = Map::new();
        ctx.insert("createasset".to_string(), Value::Object(entry));
        step.state
            .extra
            .insert("workflowContext".to_string(), Value::Object(ctx));

        assert_eq!(
            find_generated_asset(&step).as_deref(),
            Some("前段の生成物")
        );
    }

    /// アセットが見つからなければ None
    #[test]
    fn test_find_generated_asset_missing() {
        let step = review_step_with_asset(None);
        assert!(find_generated_asset(&step).is_none());
    }

    /// 役割ごとのディスパッチが存在する
    #[test]
    fn test_handler_for_all_roles() {
        for role in [
            StepRole::Selection,
            StepRole::Collection,
            StepRole::Review,
            StepRole::Generation,
            StepRole::Utility,
        ] {
            let _handler = handler_for(role);
        }
    }
}
