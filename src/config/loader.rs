//! テンプレートファイルの読み込み
//!
//! # 責務
//!
//! - TOML ファイル・文字列から [`WorkflowTemplate`] を構築
//! - ディレクトリ内の全テンプレートの一括読み込み
//!
//! バリデーション（order の一意性、依存グラフの非巡回性など）は
//! DTO からの変換時に [`WorkflowTemplate::validate`] で実施されます。

use std::path::Path;

use crate::error::ConfigError;
use crate::model::WorkflowTemplate;

use super::dto::TemplateDto;

/// TOML 文字列からテンプレートを読み込む
///
/// # 引数
///
/// * `toml_str` - TOML 形式の文字列
///
/// # 戻り値
///
/// * `Ok(WorkflowTemplate)` - パースとバリデーションに成功した場合
/// * `Err(ConfigError)` - パースまたはバリデーションに失敗した場合
pub fn template_from_toml(toml_str: &str) -> Result<WorkflowTemplate, ConfigError> {
    let dto: TemplateDto = toml::from_str(toml_str)?;
    WorkflowTemplate::try_from(dto)
}

/// TOML ファイルからテンプレートを読み込む
///
/// # 引数
///
/// * `path` - TOML ファイルのパス
pub fn template_from_file(path: impl AsRef<Path>) -> Result<WorkflowTemplate, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    template_from_toml(&content)
}

/// ディレクトリ内の `.toml` ファイルをすべて読み込む
///
/// ファイル名の辞書順で読み込みます。テンプレート以外の TOML が
/// 混在している場合はエラーになります。
///
/// # 引数
///
/// * `dir` - テンプレートファイルを含むディレクトリ
///
/// # 戻り値
///
/// * `Ok(Vec<WorkflowTemplate>)` - 読み込まれたテンプレート
/// * `Err(ConfigError)` - いずれかのファイルの読み込みに失敗した場合
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<WorkflowTemplate>, ConfigError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut templates = Vec::new();
    for path in paths {
        let template = template_from_file(&path)?;
        tracing::debug!(path = %path.display(), template = %template.name, "template loaded");
        templates.push(template);
    }
    Ok(templates)
}
