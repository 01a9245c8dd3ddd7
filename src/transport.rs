//! メッセージトランスポートのインターフェース
//!
//! # 責務
//!
//! - 会話スレッドへのメッセージ送出と直近履歴の読み出しを行う
//!   [`MessageTransport`] トレイトを定義
//! - テスト・CLI シミュレーション用のインメモリ実装 [`MemoryTransport`] を提供
//!
//! エンジンはこのトレイトを通じて、ステッププロンプトや完了通知の送出、
//! 重複抑止のための直近メッセージ走査、分類用の会話履歴の取得を行います。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::error::TransportError;

/// メッセージの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// ユーザーの発話
    User,
    /// アシスタント（エンジン）の発話
    Assistant,
    /// システム/ステータス通知（分類履歴からは除外される）
    System,
}

/// スレッド上の 1 メッセージ
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    /// 役割
    pub role: MessageRole,
    /// 本文
    pub text: String,
    /// 追記時刻
    pub created_at: SystemTime,
}

/// メッセージトランスポートの契約
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// スレッドにメッセージを追記
    async fn append(
        &self,
        thread_id: &str,
        text: &str,
        role: MessageRole,
    ) -> Result<(), TransportError>;

    /// 直近のメッセージを古い順で取得（最大 `limit` 件）
    async fn recent(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ThreadMessage>, TransportError>;
}

/// インメモリのトランスポート実装
#[derive(Debug, Default)]
pub struct MemoryTransport {
    threads: Mutex<HashMap<String, Vec<ThreadMessage>>>,
}

impl MemoryTransport {
    /// 空のトランスポートを生成
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn append(
        &self,
        thread_id: &str,
        text: &str,
        role: MessageRole,
    ) -> Result<(), TransportError> {
        let mut threads = self
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        threads
            .entry(thread_id.to_string())
            .or_default()
            .push(ThreadMessage {
                role,
                text: text.to_string(),
                created_at: SystemTime::now(),
            });
        Ok(())
    }

    async fn recent(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ThreadMessage>, TransportError> {
        let threads = self
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let messages = threads.get(thread_id).cloned().unwrap_or_default();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 追記と直近取得
    #[tokio::test]
    async fn test_append_and_recent() {
        let transport = MemoryTransport::new();
        for i in 0..5 {
            transport
                .append("th-1", &format!("msg {i}"), MessageRole::User)
                .await
                .unwrap();
        }

        let recent = transport.recent("th-1", 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].text, "msg 2");
        assert_eq!(recent[2].text, "msg 4");
    }

    /// 存在しないスレッドは空
    #[tokio::test]
    async fn test_recent_empty_thread() {
        let transport = MemoryTransport::new();
        assert!(transport.recent("none", 10).await.unwrap().is_empty());
    }
}
