mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "drift")]
#[command(about = "宣言したリソースを、宣言した通りに。", long_about = None)]
struct Cli {
    /// プロジェクトディレクトリ (省略時はカレントディレクトリ)
    #[arg(short = 'C', long = "dir", global = true, env = "DRIFTFLOW_PROJECT_DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 変更計画を表示
    Plan {
        /// マニフェストファイル
        #[arg(short, long, default_value = "resources.yaml", env = "DRIFTFLOW_MANIFEST")]
        file: PathBuf,
        /// 全リソースの削除計画を表示
        #[arg(long)]
        destroy: bool,
        /// 計画を JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// 変更を適用
    Apply {
        /// マニフェストファイル
        #[arg(short, long, default_value = "resources.yaml", env = "DRIFTFLOW_MANIFEST")]
        file: PathBuf,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 管理中の全リソースを削除
    Destroy {
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 実リソースを読み取り、ステートとの差分 (ドリフト) を取り込む
    Refresh,
    /// ステートを操作
    #[command(subcommand)]
    State(StateCommands),
    /// 残ったステートロックを強制解除
    #[command(name = "force-unlock")]
    ForceUnlock {
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// バージョン情報を表示
    Version,
}

#[derive(Subcommand)]
enum StateCommands {
    /// 管理中のリソース一覧
    List,
    /// リソースの記録内容を表示
    Show {
        /// リソース (type.name)
        resource: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログは stderr に出力 (RUST_LOG で調整)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    // Versionコマンドはプロジェクト不要
    if matches!(cli.command, Commands::Version) {
        println!("driftflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let project_root = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let project = utils::Project::load(&project_root)?;

    match cli.command {
        Commands::Plan {
            file,
            destroy,
            json,
        } => {
            commands::plan::handle(&project, &file, destroy, json).await?;
        }
        Commands::Apply { file, yes } => {
            commands::apply::handle(&project, &file, yes).await?;
        }
        Commands::Destroy { yes } => {
            commands::destroy::handle(&project, yes).await?;
        }
        Commands::Refresh => {
            commands::refresh::handle(&project).await?;
        }
        Commands::State(state_cmd) => match state_cmd {
            StateCommands::List => commands::state::handle_list(&project).await?,
            StateCommands::Show { resource } => {
                commands::state::handle_show(&project, &resource).await?
            }
        },
        Commands::ForceUnlock { yes } => {
            commands::unlock::handle(&project, yes).await?;
        }
        Commands::Version => unreachable!(),
    }

    Ok(())
}
