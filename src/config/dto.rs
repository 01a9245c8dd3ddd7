//! TOML デシリアライズ用の DTO (Data Transfer Object)
//!
//! # 責務
//!
//! このモジュールは、TOML ファイルからのデータ読み込み専用の構造体を提供します。
//! DTO はバリデーション前の「生データ」を表現し、ドメインモデルとは分離されています。
//!
//! ## 変換フロー
//!
//! ```text
//! TOML ファイル
//!   ↓ (デシリアライズ)
//! TemplateDto
//!   ↓ (TryFrom でバリデーション)
//! WorkflowTemplate (ドメインモデル)
//! ```

use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::{StepConfig, StepDefinition, StepRole, StepType, WorkflowTemplate};

/// テンプレート DTO
///
/// TOML の `[template]` セクションと `[[steps]]` 配列をデシリアライズします。
///
/// **注**: この構造体は config モジュール内部の実装詳細です。
/// 外部からは [`WorkflowTemplate`] を使用してください。
#[derive(Debug, Deserialize)]
pub(super) struct TemplateDto {
    /// テンプレートのメタデータ
    pub(super) template: TemplateMetaDto,
    /// ステップの配列
    pub(super) steps: Vec<StepDto>,
}

/// テンプレートメタデータ DTO
#[derive(Debug, Deserialize)]
pub(super) struct TemplateMetaDto {
    /// テンプレート ID（省略時は名前から導出）
    pub(super) id: Option<String>,
    /// テンプレート名
    pub(super) name: String,
    /// 説明
    pub(super) description: Option<String>,
}

/// ステップ DTO
#[derive(Debug, Deserialize)]
pub(super) struct StepDto {
    /// ステップ名
    pub(super) name: String,
    /// ステップの種類（例: "JSON_DIALOG"）
    #[serde(rename = "type")]
    pub(super) step_type: StepType,
    /// 役割（省略時は collection）
    #[serde(default)]
    pub(super) role: StepRole,
    /// 実行順序
    pub(super) order: u32,
    /// 依存するステップ名
    #[serde(default)]
    pub(super) dependencies: Vec<String>,
    /// ステップ開始時のプロンプト
    #[serde(default)]
    pub(super) prompt: Option<String>,
    /// 構造的設定
    #[serde(default)]
    pub(super) config: StepConfig,
}

/// 名前からテンプレート ID を導出（小文字化・空白をハイフンに）
fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}

/// DTO からドメインモデルへの変換（読み込み方向）
///
/// 構造のバリデーションを実施し、不正なデータの場合は
/// [`ConfigError::Validation`] を返します。
impl TryFrom<TemplateDto> for WorkflowTemplate {
    type Error = ConfigError;

    fn try_from(dto: TemplateDto) -> Result<Self, Self::Error> {
        let id = dto
            .template
            .id
            .unwrap_or_else(|| slugify(&dto.template.name));

        let steps = dto
            .steps
            .into_iter()
            .map(|s| StepDefinition {
                name: s.name,
                step_type: s.step_type,
                role: s.role,
                order: s.order,
                dependencies: s.dependencies,
                prompt: s.prompt,
                config: s.config,
            })
            .collect();

        let template = WorkflowTemplate {
            id,
            name: dto.template.name,
            description: dto.template.description,
            steps,
        };
        template.validate()?;
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 名前からの ID 導出
    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Press Release"), "press-release");
        assert_eq!(slugify("  Workflow Selector "), "workflow-selector");
    }
}
