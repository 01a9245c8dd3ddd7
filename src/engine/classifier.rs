//! 完了分類プロトコル
//!
//! # 責務
//!
//! - ステップ設定・収集済み情報・会話履歴から分類プロンプトを構築
//! - 補完サービスの応答（JSON）を [`Verdict`] に正規化
//! - パース失敗・タイムアウト・サービス障害を会話的なフォールバックに変換
//! - フィールド充足のあいまい照合と完了率の計算
//!
//! 分類経路はどんな失敗でも `Err` を返しません。会話を壊さないことが
//! このモジュールの最重要の契約です。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::model::{StepConfig, StepInstance};
use crate::provider::{CompletionClient, ModelTier};
use crate::transport::{MessageRole, ThreadMessage};

use super::result::Verdict;

/// 生成に進む準備ができたと見なす完了率のしきい値
pub const READINESS_THRESHOLD: f32 = 0.6;

/// フィールド階層ごとの重み
const ESSENTIAL_WEIGHT: f32 = 0.7;
const IMPORTANT_WEIGHT: f32 = 0.2;
const OPTIONAL_WEIGHT: f32 = 0.1;

/// 分類に渡す会話履歴の最大件数
pub const HISTORY_LIMIT: usize = 20;

/// 補完サービス呼び出しの既定タイムアウト
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// パース失敗時の定型応答
pub const CLARIFICATION_FALLBACK: &str =
    "すみません、うまく読み取れませんでした。もう少し詳しく教えていただけますか？";

/// サービス障害時の定型応答
pub const SERVICE_FAILURE_FALLBACK: &str =
    "申し訳ありません、一時的に応答を処理できませんでした。もう一度お送りいただけますか？";

/// 収集情報から除外する生データのキー（正規化後）
const SENSITIVE_KEYS: &[&str] = &[
    "apiresponse",
    "rawresponse",
    "rawapiresponse",
    "searchresults",
    "tooloutput",
    "httpheaders",
    "responseheaders",
    "rawhtml",
];

/// 肯定的な入力と見なすキーワード（サービス障害時のヒューリスティック）
const AFFIRMATIVE_HINTS: &[&str] = &[
    "はい",
    "お願いします",
    "進めて",
    "作成して",
    "生成して",
    "yes",
    "ok",
    "proceed",
    "go ahead",
    "generate",
];

/// キーの正規化（小文字化・空白/アンダースコア/ハイフン除去）
fn normalize_key(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// フィールド名を単語に分解（空白・アンダースコア・キャメルケース境界）
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in s.chars() {
        if c.is_whitespace() || c == '_' || c == '-' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else if c.is_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
            current.extend(c.to_lowercase());
        } else {
            current.extend(c.to_lowercase());
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// 収集情報のマップからキーを再帰的に集める（正規化済み）
fn collect_keys(map: &Map<String, Value>, out: &mut Vec<String>) {
    for (key, value) in map {
        out.push(normalize_key(key));
        if let Value::Object(inner) = value {
            collect_keys(inner, out);
        }
    }
}

/// フィールドが収集済みキーのいずれかに合致するか（あいまい照合）
///
/// 正規化後の部分文字列一致（双方向）か、複数語フィールドの全単語が
/// キーに含まれる場合に合致と見なします。
pub fn field_provided(field: &str, keys: &[String]) -> bool {
    let needle = normalize_key(field);
    if needle.is_empty() {
        return false;
    }
    for key in keys {
        if key.contains(&needle) || needle.contains(key.as_str()) {
            return true;
        }
    }
    let words = split_words(field);
    if words.len() > 1 {
        for key in keys {
            if words.iter().all(|w| key.contains(w.as_str())) {
                return true;
            }
        }
    }
    false
}

/// 収集情報から生データのキーを再帰的に除去
pub fn sanitize_collected(map: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        if SENSITIVE_KEYS.contains(&normalize_key(key).as_str()) {
            continue;
        }
        let cleaned = match value {
            Value::Object(inner) => Value::Object(sanitize_collected(inner)),
            other => other.clone(),
        };
        out.insert(key.clone(), cleaned);
    }
    out
}

/// フィールド階層（必須・重要・任意）
#[derive(Debug, Clone)]
pub struct FieldTiers {
    pub essential: Vec<String>,
    pub important: Vec<String>,
    pub optional: Vec<String>,
}

impl FieldTiers {
    /// ステップ設定からフィールド階層を構築
    ///
    /// 階層が一切設定されていないステップには汎用フォールバック
    /// （topic / details）を適用します。
    pub fn from_config(config: &StepConfig) -> Self {
        if config.has_no_fields() {
            return Self {
                essential: vec!["topic".to_string()],
                important: vec!["details".to_string()],
                optional: vec![],
            };
        }
        Self {
            essential: config.essential.clone(),
            important: config.important.clone(),
            optional: config.optional.clone(),
        }
    }

    /// 階層内のフィールドを充足済み/未充足に分ける
    fn partition<'a>(fields: &'a [String], keys: &[String]) -> (Vec<&'a str>, Vec<&'a str>) {
        let mut provided = Vec::new();
        let mut missing = Vec::new();
        for field in fields {
            if field_provided(field, keys) {
                provided.push(field.as_str());
            } else {
                missing.push(field.as_str());
            }
        }
        (provided, missing)
    }
}

/// 完了率を計算（0.0〜1.0）
///
/// 各階層の寄与は「重み × 充足数 / 階層サイズ」。空の階層は 0 として
/// 扱います（設定されていない階層が完了率を押し上げることはない）。
pub fn completion_percentage(tiers: &FieldTiers, collected: &Map<String, Value>) -> f32 {
    let mut keys = Vec::new();
    collect_keys(collected, &mut keys);

    let tier_score = |fields: &[String], weight: f32| -> f32 {
        if fields.is_empty() {
            return 0.0;
        }
        let provided = fields.iter().filter(|f| field_provided(f, &keys)).count();
        weight * provided as f32 / fields.len() as f32
    };

    tier_score(&tiers.essential, ESSENTIAL_WEIGHT)
        + tier_score(&tiers.important, IMPORTANT_WEIGHT)
        + tier_score(&tiers.optional, OPTIONAL_WEIGHT)
}

/// マークダウンのコードフェンスを剥がし、最初の JSON オブジェクトを抽出
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let without_fence = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.strip_suffix("```").unwrap_or(rest)
    } else {
        trimmed
    };
    let start = without_fence.find('{')?;
    let end = without_fence.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&without_fence[start..=end])
}

/// JSON 値からキーのバリアント揺れを吸収して取り出す
fn get_variant<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    for name in names {
        if let Some(v) = obj.get(*name) {
            return Some(v);
        }
    }
    None
}

/// 補完サービスの応答を [`Verdict`] にパース
///
/// キー名の揺れ（`isComplete` / `isStepComplete`、`extractedInformation` /
/// `collectedInformation`）を吸収します。パース不能な場合は定型の
/// 聞き返し応答にフォールバックし、既存の収集情報を保持します。
pub fn parse_verdict(raw: &str, previous: &Map<String, Value>) -> Verdict {
    let parsed = extract_json(raw).and_then(|json| serde_json::from_str::<Value>(json).ok());
    let Some(Value::Object(obj)) = parsed else {
        tracing::warn!("classification response was not valid JSON, using fallback");
        return clarification_fallback(previous);
    };

    let is_step_complete = get_variant(&obj, &["isStepComplete", "isComplete", "stepComplete"])
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut collected = previous.clone();
    if let Some(Value::Object(extracted)) =
        get_variant(&obj, &["collectedInformation", "extractedInformation"])
    {
        for (k, v) in sanitize_collected(extracted) {
            collected.insert(k, v);
        }
    }

    let next_question = get_variant(&obj, &["nextQuestion", "response", "message"])
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty());

    let suggested_next_step = obj
        .get("suggestedNextStep")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let ready_to_generate = obj
        .get("readyToGenerate")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mode = obj.get("mode").and_then(Value::as_str).map(|s| s.to_string());

    Verdict {
        is_step_complete,
        collected_information: collected,
        next_question,
        suggested_next_step,
        ready_to_generate,
        mode,
    }
}

/// パース失敗時のフォールバック（既存の収集情報を保持）
fn clarification_fallback(previous: &Map<String, Value>) -> Verdict {
    Verdict {
        is_step_complete: false,
        collected_information: previous.clone(),
        next_question: Some(CLARIFICATION_FALLBACK.to_string()),
        suggested_next_step: None,
        ready_to_generate: false,
        mode: Some("fallback".to_string()),
    }
}

/// サービス障害時のフォールバック
///
/// 入力が明確に肯定的ならステップ完了と見なして前進を優先し、
/// そうでなければ再送を促します。
fn service_failure_fallback(input: &str, previous: &Map<String, Value>) -> Verdict {
    let lowered = input.to_lowercase();
    let affirmative = AFFIRMATIVE_HINTS.iter().any(|hint| lowered.contains(hint));
    Verdict {
        is_step_complete: affirmative,
        collected_information: previous.clone(),
        next_question: if affirmative {
            None
        } else {
            Some(SERVICE_FAILURE_FALLBACK.to_string())
        },
        suggested_next_step: None,
        ready_to_generate: affirmative,
        mode: Some("fallback".to_string()),
    }
}

/// 会話履歴をプロンプト用のテキストに整形（System は除外）
fn render_history(history: &[ThreadMessage]) -> String {
    history
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| {
            let who = match m.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::System => unreachable!(),
            };
            format!("{who}: {}", m.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 完了分類器
///
/// 補完サービスへの呼び出しをタイムアウト付きでラップし、
/// 応答を [`Verdict`] に正規化します。
pub struct CompletionClassifier {
    completion: Arc<dyn CompletionClient>,
    timeout: Duration,
}

impl CompletionClassifier {
    pub fn new(completion: Arc<dyn CompletionClient>, timeout: Duration) -> Self {
        Self {
            completion,
            timeout,
        }
    }

    /// ステップの完了分類を実行
    ///
    /// どんな失敗でも `Verdict` を返します（分類経路は会話を壊さない）。
    pub async fn classify(
        &self,
        step: &StepInstance,
        input: &str,
        history: &[ThreadMessage],
    ) -> Verdict {
        let tiers = FieldTiers::from_config(&step.config);
        let sanitized = sanitize_collected(&step.state.collected_information);
        let system_prompt = build_classification_prompt(step, &tiers, &sanitized);

        let mut user_content = String::new();
        let rendered = render_history(history);
        if !rendered.is_empty() {
            user_content.push_str("Conversation so far:\n");
            user_content.push_str(&rendered);
            user_content.push_str("\n\n");
        }
        user_content.push_str("Latest user message:\n");
        user_content.push_str(input);

        match self
            .call_with_timeout(&system_prompt, &user_content, ModelTier::Medium, None)
            .await
        {
            Ok(content) => parse_verdict(&content, &step.state.collected_information),
            Err(error) => {
                tracing::warn!(step = %step.name, %error, "classification call failed");
                service_failure_fallback(input, &step.state.collected_information)
            }
        }
    }

    /// 自由テキスト生成（生成・レビュー・補助ステップから使用）
    ///
    /// `chunks` が指定されていればストリーミング版を使います。
    /// 分類と異なり、失敗は呼び出し元へ返します。
    pub async fn generate_text(
        &self,
        system_prompt: &str,
        user_input: &str,
        tier: ModelTier,
        chunks: Option<mpsc::Sender<String>>,
    ) -> Result<String, ProviderError> {
        self.call_with_timeout(system_prompt, user_input, tier, chunks)
            .await
    }

    async fn call_with_timeout(
        &self,
        system_prompt: &str,
        user_input: &str,
        tier: ModelTier,
        chunks: Option<mpsc::Sender<String>>,
    ) -> Result<String, ProviderError> {
        let call = async {
            match chunks {
                Some(tx) => {
                    self.completion
                        .generate_streaming(system_prompt, user_input, tier, tx)
                        .await
                }
                None => self.completion.generate(system_prompt, user_input, tier).await,
            }
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => {
                let response = result?;
                tracing::debug!(
                    model = %response.model,
                    tokens = response.token_usage.total(),
                    "completion call finished"
                );
                Ok(response.content)
            }
            Err(_) => Err(ProviderError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// 分類プロンプトを構築
///
/// プロトコル部分（JSON 契約）は英語で固定です。
fn build_classification_prompt(
    step: &StepInstance,
    tiers: &FieldTiers,
    sanitized: &Map<String, Value>,
) -> String {
    let mut keys = Vec::new();
    collect_keys(sanitized, &mut keys);
    let percent = completion_percentage(tiers, sanitized);

    let mut prompt = String::new();
    prompt.push_str(
        "You are a conversation step classifier for a multi-step workflow engine.\n",
    );
    prompt.push_str(&format!("Current step: {}\n", step.name));
    if let Some(goal) = &step.config.goal {
        prompt.push_str(&format!("Step goal: {goal}\n"));
    }
    if let Some(instructions) = &step.config.base_instructions {
        prompt.push_str(&format!("Instructions: {instructions}\n"));
    }
    prompt.push('\n');

    let mut tier_section = |label: &str, fields: &[String]| {
        if fields.is_empty() {
            return;
        }
        let (provided, missing) = FieldTiers::partition(fields, &keys);
        prompt.push_str(&format!(
            "{label} fields — provided: [{}], missing: [{}]\n",
            provided.join(", "),
            missing.join(", ")
        ));
    };
    tier_section("Essential", &tiers.essential);
    tier_section("Important", &tiers.important);
    tier_section("Optional", &tiers.optional);

    prompt.push_str(&format!(
        "\nCompletion: {:.0}% (threshold to proceed: {:.0}%)\n",
        percent * 100.0,
        READINESS_THRESHOLD * 100.0
    ));

    prompt.push_str("\nInformation collected so far (JSON):\n");
    prompt.push_str(
        &serde_json::to_string_pretty(&Value::Object(sanitized.clone()))
            .unwrap_or_else(|_| "{}".to_string()),
    );

    prompt.push_str("\n\nRules:\n");
    prompt.push_str("- Ask for missing essential fields first, then important ones.\n");
    prompt.push_str("- Never re-ask for information that is already provided.\n");
    prompt.push_str(
        "- If the user says they do not know a field, record it as \"unavailable\" and do not ask again.\n",
    );
    prompt.push_str("- If the user asks a direct question, answer it before asking your own.\n");
    prompt.push_str("- Ask at most one question per turn, in Japanese.\n");
    if percent >= READINESS_THRESHOLD {
        prompt.push_str(
            "- Enough information is available: offer to proceed, and if the user agrees, mark the step complete.\n",
        );
    }

    prompt.push_str("\nRespond with ONLY a JSON object in this exact shape:\n");
    prompt.push_str(
        r#"{
  "isStepComplete": boolean,
  "collectedInformation": { "field": "value" },
  "nextQuestion": "string or null",
  "suggestedNextStep": "string or null",
  "readyToGenerate": boolean,
  "mode": "collecting" | "ready"
}"#,
    );
    prompt.push_str("\nDo not wrap the JSON in markdown fences.\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    /// あいまい照合: 大文字小文字・空白・アンダースコアを無視
    #[test]
    fn test_field_provided_fuzzy() {
        let keys = vec![normalize_key("company_name"), normalize_key("Launch Date")];
        assert!(field_provided("companyName", &keys));
        assert!(field_provided("COMPANY NAME", &keys));
        assert!(field_provided("launchDate", &keys));
        assert!(!field_provided("budget", &keys));
    }

    /// あいまい照合: 部分文字列の双方向一致
    #[test]
    fn test_field_provided_substring() {
        let keys = vec![normalize_key("productLaunchDate")];
        assert!(field_provided("launchDate", &keys));
        let keys = vec![normalize_key("date")];
        assert!(field_provided("launchDate", &keys));
    }

    /// あいまい照合: 複数語フィールドの語順非依存一致
    #[test]
    fn test_field_provided_word_overlap() {
        let keys = vec![normalize_key("dateOfLaunch")];
        assert!(field_provided("launch date", &keys));
    }

    /// 完了率: 必須 2 つのうち 1 つで 35%
    #[test]
    fn test_completion_percentage_half_essential() {
        let tiers = FieldTiers {
            essential: vec!["companyName".to_string(), "announcementType".to_string()],
            important: vec![],
            optional: vec![],
        };
        let collected = map(&[("companyName", "Acme")]);
        let pct = completion_percentage(&tiers, &collected);
        assert!((pct - 0.35).abs() < 1e-6);
    }

    /// 完了率: 空の階層は寄与しない
    #[test]
    fn test_completion_percentage_empty_tiers() {
        let tiers = FieldTiers {
            essential: vec!["topic".to_string()],
            important: vec![],
            optional: vec![],
        };
        let collected = map(&[("topic", "発表")]);
        let pct = completion_percentage(&tiers, &collected);
        assert!((pct - 0.7).abs() < 1e-6);
    }

    /// 完了率: 全階層充足で 100%
    #[test]
    fn test_completion_percentage_full() {
        let tiers = FieldTiers {
            essential: vec!["a".to_string()],
            important: vec!["b".to_string()],
            optional: vec!["c".to_string()],
        };
        let collected = map(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let pct = completion_percentage(&tiers, &collected);
        assert!((pct - 1.0).abs() < 1e-6);
    }

    /// フィールド未設定のステップには汎用フォールバック
    #[test]
    fn test_field_tiers_generic_fallback() {
        let tiers = FieldTiers::from_config(&StepConfig::default());
        assert_eq!(tiers.essential, vec!["topic"]);
        assert_eq!(tiers.important, vec!["details"]);
    }

    /// サニタイズ: 生データのキーを再帰的に除去
    #[test]
    fn test_sanitize_collected() {
        let mut inner = Map::new();
        inner.insert("apiResponse".to_string(), Value::String("raw".to_string()));
        inner.insert("summary".to_string(), Value::String("ok".to_string()));
        let mut outer = Map::new();
        outer.insert("searchResults".to_string(), Value::String("big".to_string()));
        outer.insert("nested".to_string(), Value::Object(inner));
        outer.insert("companyName".to_string(), Value::String("Acme".to_string()));

        let cleaned = sanitize_collected(&outer);
        assert!(!cleaned.contains_key("searchResults"));
        assert!(cleaned.contains_key("companyName"));
        let nested = cleaned.get("nested").and_then(Value::as_object).unwrap();
        assert!(!nested.contains_key("apiResponse"));
        assert!(nested.contains_key("summary"));
    }

    /// コードフェンス付き JSON の抽出
    #[test]
    fn test_extract_json_with_fences() {
        let raw = "```json\n{\"isStepComplete\": true}\n```";
        assert_eq!(extract_json(raw), Some("{\"isStepComplete\": true}"));
    }

    /// 前置きテキスト付き JSON の抽出
    #[test]
    fn test_extract_json_with_prose() {
        let raw = "Here is the result: {\"a\": 1} hope it helps";
        assert_eq!(extract_json(raw), Some("{\"a\": 1}"));
    }

    /// 正常な判定のパース
    #[test]
    fn test_parse_verdict_complete() {
        let raw = r#"{
            "isStepComplete": true,
            "collectedInformation": { "companyName": "Acme" },
            "nextQuestion": null,
            "readyToGenerate": true,
            "mode": "ready"
        }"#;
        let verdict = parse_verdict(raw, &Map::new());
        assert!(verdict.is_step_complete);
        assert!(verdict.ready_to_generate);
        assert_eq!(
            verdict.collected_information.get("companyName").and_then(Value::as_str),
            Some("Acme")
        );
        assert!(verdict.next_question.is_none());
    }

    /// キー揺れ（isComplete / extractedInformation）の吸収
    #[test]
    fn test_parse_verdict_variant_keys() {
        let raw = r#"{
            "isComplete": true,
            "extractedInformation": { "topic": "資金調達" }
        }"#;
        let verdict = parse_verdict(raw, &Map::new());
        assert!(verdict.is_step_complete);
        assert_eq!(
            verdict.collected_information.get("topic").and_then(Value::as_str),
            Some("資金調達")
        );
    }

    /// 新しい収集情報は既存にマージされる（後勝ち）
    #[test]
    fn test_parse_verdict_merges_previous() {
        let previous = map(&[("companyName", "Acme"), ("topic", "旧")]);
        let raw = r#"{ "isStepComplete": false, "collectedInformation": { "topic": "新" } }"#;
        let verdict = parse_verdict(raw, &previous);
        assert_eq!(
            verdict.collected_information.get("companyName").and_then(Value::as_str),
            Some("Acme")
        );
        assert_eq!(
            verdict.collected_information.get("topic").and_then(Value::as_str),
            Some("新")
        );
    }

    /// パース不能な応答は聞き返しフォールバック（収集情報を保持）
    #[test]
    fn test_parse_verdict_fallback_preserves_collected() {
        let previous = map(&[("companyName", "Acme")]);
        let verdict = parse_verdict("これは JSON ではありません", &previous);
        assert!(!verdict.is_step_complete);
        assert_eq!(verdict.next_question.as_deref(), Some(CLARIFICATION_FALLBACK));
        assert_eq!(
            verdict.collected_information.get("companyName").and_then(Value::as_str),
            Some("Acme")
        );
        assert_eq!(verdict.mode.as_deref(), Some("fallback"));
    }

    /// パース後の収集情報もサニタイズされる
    #[test]
    fn test_parse_verdict_sanitizes() {
        let raw = r#"{ "isStepComplete": false, "collectedInformation": { "rawResponse": "x", "name": "y" } }"#;
        let verdict = parse_verdict(raw, &Map::new());
        assert!(!verdict.collected_information.contains_key("rawResponse"));
        assert!(verdict.collected_information.contains_key("name"));
    }

    /// サービス障害時: 肯定的な入力は前進を優先する
    #[test]
    fn test_service_failure_fallback_affirmative() {
        let verdict = service_failure_fallback("はい、お願いします", &Map::new());
        assert!(verdict.is_step_complete);
        assert!(verdict.next_question.is_none());
    }

    /// サービス障害時: それ以外は再送を促す
    #[test]
    fn test_service_failure_fallback_other() {
        let verdict = service_failure_fallback("会社名は Acme です", &Map::new());
        assert!(!verdict.is_step_complete);
        assert_eq!(verdict.next_question.as_deref(), Some(SERVICE_FAILURE_FALLBACK));
    }
}
