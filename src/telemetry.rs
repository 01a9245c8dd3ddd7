//! ロギング初期化
//!
//! # 責務
//!
//! - `tracing` サブスクライバーの初期化（コンソール出力）
//! - 任意で JSON 形式のファイル出力を追加
//!
//! フィルタは環境変数 `RUST_LOG` で制御します（未設定時は `info`）。

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// コンソール向けのロギングを初期化
///
/// テストやライブラリ利用では呼び出し側の初期化を尊重するため、
/// 二重初期化は無視されます。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// コンソール出力に加えて JSON 形式のログファイルを書き出す
///
/// # 引数
///
/// - `dir`: ログファイルの出力先ディレクトリ（日次ローテーション）
///
/// # 戻り値
///
/// 返される [`WorkerGuard`] を drop するとバッファがフラッシュされる
/// ため、プロセス終了まで保持してください。
pub fn init_with_file(dir: &str) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(dir, "kaiwa-flow.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false),
        )
        .try_init();
    guard
}
