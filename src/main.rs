//! Kaiwa Flow CLI
//!
//! テンプレートの検証・一覧と、インメモリのコラボレーターを使った
//! 会話シミュレーションを提供します。

use std::io::{BufRead, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use kaiwa_flow::engine::WorkflowEngine;
use kaiwa_flow::provider::{ProviderKind, create_client};
use kaiwa_flow::registry::TemplateRegistry;
use kaiwa_flow::store::MemoryStore;
use kaiwa_flow::transport::MemoryTransport;

#[derive(Parser)]
#[command(name = "kaiwa-flow", about = "会話型ワークフローオーケストレーションエンジン")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// テンプレートディレクトリを検証する
    Validate {
        /// テンプレート（TOML）のディレクトリ
        dir: String,
    },
    /// 登録可能なテンプレートを一覧する
    List {
        /// テンプレート（TOML）のディレクトリ
        dir: String,
    },
    /// 対話シミュレーションを実行する（終了は Ctrl-D または "exit"）
    Simulate {
        /// テンプレート（TOML）のディレクトリ
        #[arg(long, default_value = "templates")]
        templates: String,
        /// 最初に開始するテンプレートの名前または ID
        #[arg(long)]
        template: Option<String>,
        /// 補完サービスのバックエンド
        #[arg(long, value_enum, default_value_t = Provider::Claude)]
        provider: Provider,
        /// スレッド ID
        #[arg(long, default_value = "local")]
        thread: String,
        /// JSON ログの出力先ディレクトリ
        #[arg(long)]
        log_dir: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    /// OpenAI 互換 HTTP API（環境変数 OPENAI_API_KEY）
    Openai,
    /// Claude CLI（claude コマンド）
    Claude,
}

impl From<Provider> for ProviderKind {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::Openai => ProviderKind::OpenAi,
            Provider::Claude => ProviderKind::Claude,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { dir } => {
            kaiwa_flow::telemetry::init();
            let registry = TemplateRegistry::from_dir(&dir)?;
            println!("OK: {} 件のテンプレートを検証しました", registry.len());
        }
        Commands::List { dir } => {
            kaiwa_flow::telemetry::init();
            let registry = TemplateRegistry::from_dir(&dir)?;
            for template in registry.list() {
                let kind = if template.is_selector() { " (selector)" } else { "" };
                println!(
                    "{} [{}]{} - {} steps",
                    template.name,
                    template.id,
                    kind,
                    template.steps.len()
                );
            }
        }
        Commands::Simulate {
            templates,
            template,
            provider,
            thread,
            log_dir,
        } => {
            // guard はプロセス終了までログをフラッシュするために保持する
            let _guard = match &log_dir {
                Some(dir) => Some(kaiwa_flow::telemetry::init_with_file(dir)),
                None => {
                    kaiwa_flow::telemetry::init();
                    None
                }
            };

            let registry = Arc::new(TemplateRegistry::from_dir(&templates)?);
            let transport = Arc::new(MemoryTransport::new());
            let completion: Arc<dyn kaiwa_flow::provider::CompletionClient> =
                Arc::from(create_client(provider.into())?);
            let mut engine = WorkflowEngine::new(
                Arc::new(MemoryStore::new()),
                transport,
                completion,
                registry.clone(),
            );
            if let Some(template_ref) = template {
                engine = engine.with_fallback_template(template_ref);
            } else if let Some(selector) = registry.list().into_iter().find(|t| t.is_selector()) {
                engine = engine.with_fallback_template(selector.name);
            }

            simulate(&engine, &thread).await?;
        }
    }
    Ok(())
}

/// 標準入出力での対話ループ
async fn simulate(
    engine: &WorkflowEngine,
    thread_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    println!("対話を開始します（exit で終了）");
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" {
            break;
        }

        match engine.handle_message(thread_id, input).await {
            Ok(response) => {
                println!("{}", response.text);
                if response.workflow_completed {
                    println!("--- ワークフロー完了 ---");
                }
            }
            Err(error) => eprintln!("エラー: {error}"),
        }
    }
    Ok(())
}
