//! テンプレートレジストリ
//!
//! # 責務
//!
//! - ワークフローテンプレートの登録と検索を提供
//! - 検索順序: ID 完全一致 → 名前完全一致 → 部分一致（互換シム）
//!
//! テンプレートは純粋なデータであり、このモジュールに副作用はありません。
//!
//! # 検索順序について
//!
//! 部分一致フォールバックは旧来の呼び出し互換のために残している
//! 経過措置です。ワークフロー遷移（セレクター完了時）では曖昧な遷移を
//! 避けるため完全一致のみを使用します（[`TemplateRegistry::get_by_name`]）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::error::ConfigError;
use crate::model::WorkflowTemplate;

/// テンプレートレジストリ
///
/// 名前/ID からテンプレートへの不変マッピングを保持します。
/// 登録時に [`WorkflowTemplate::validate`] による構造検証を行います。
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
}

impl TemplateRegistry {
    /// 空のレジストリを生成
    pub fn new() -> Self {
        Self::default()
    }

    /// ディレクトリ内の TOML テンプレートを読み込んでレジストリを構築
    ///
    /// # 引数
    ///
    /// * `dir` - テンプレートファイルを含むディレクトリ
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let registry = Self::new();
        for template in crate::config::load_dir(dir)? {
            registry.register(template)?;
        }
        Ok(registry)
    }

    /// テンプレートを登録
    ///
    /// 同じ ID の既存テンプレートは置き換えられます。
    ///
    /// # 戻り値
    ///
    /// * `Ok(())` - 登録に成功した場合
    /// * `Err(ConfigError::Validation)` - テンプレートの構造が不正な場合
    pub fn register(&self, template: WorkflowTemplate) -> Result<(), ConfigError> {
        template.validate()?;
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates.insert(template.id.clone(), template);
        Ok(())
    }

    /// ID 完全一致でテンプレートを取得
    pub fn get_by_id(&self, id: &str) -> Option<WorkflowTemplate> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates.get(id).cloned()
    }

    /// 名前完全一致でテンプレートを取得
    ///
    /// ワークフロー遷移はこのメソッドのみを使用します（曖昧さの排除）。
    pub fn get_by_name(&self, name: &str) -> Option<WorkflowTemplate> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates.values().find(|t| t.name == name).cloned()
    }

    /// ID → 名前 → 部分一致の順でテンプレートを解決
    ///
    /// 部分一致は互換シムであり、主要経路では使用しないこと。
    /// 大文字小文字を無視した部分文字列マッチで、複数候補がある場合は
    /// 名前の辞書順で最初のものを返します。
    pub fn resolve(&self, name_or_id: &str) -> Option<WorkflowTemplate> {
        if let Some(t) = self.get_by_id(name_or_id) {
            return Some(t);
        }
        if let Some(t) = self.get_by_name(name_or_id) {
            return Some(t);
        }

        let needle = name_or_id.to_lowercase();
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut candidates: Vec<&WorkflowTemplate> = templates
            .values()
            .filter(|t| {
                let name = t.name.to_lowercase();
                name.contains(&needle) || needle.contains(&name)
            })
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        let found = candidates.first().cloned().cloned();
        if let Some(t) = &found {
            tracing::debug!(query = %name_or_id, resolved = %t.name, "fuzzy template match");
        }
        found
    }

    /// 登録済みテンプレートの一覧（名前の辞書順）
    pub fn list(&self) -> Vec<WorkflowTemplate> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<WorkflowTemplate> = templates.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// 登録済みテンプレート数
    pub fn len(&self) -> usize {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates.len()
    }

    /// レジストリが空かどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
