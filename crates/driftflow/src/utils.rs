use colored::Colorize;
use driftflow_config::Settings;
use driftflow_engine::{
    ActionType, ApplyReport, ChangeSet, Engine, EntryStatus, ProviderRegistry, ResourceDeclaration,
    StateStore,
};
use driftflow_provider_local::LocalProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 読み込み済みのプロジェクト
pub struct Project {
    pub root: PathBuf,
    pub settings: Settings,
    pub engine: Engine,
}

impl Project {
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let settings = driftflow_config::load_settings_in(root)?;
        let store = StateStore::new(settings.state_dir(root));
        let registry = ProviderRegistry::new().with(Arc::new(LocalProvider::new(
            settings.local_root(root),
        )));
        let engine = Engine::new(store, registry, settings.engine_options());

        Ok(Self {
            root: root.to_path_buf(),
            settings,
            engine,
        })
    }

    /// マニフェストを読み込む (相対パスはプロジェクトルート基準)
    pub fn load_manifest(&self, file: &Path) -> anyhow::Result<Vec<ResourceDeclaration>> {
        let path = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        };
        // stdout は計画出力 (--json) 用に空けておく
        eprintln!("マニフェスト: {}", path.display().to_string().cyan());
        Ok(driftflow_config::load_manifest(&path)?)
    }
}

fn action_symbol(action: ActionType) -> colored::ColoredString {
    match action {
        ActionType::Create => "+".green().bold(),
        ActionType::Update => "~".yellow().bold(),
        ActionType::Delete => "-".red().bold(),
        ActionType::Replace => "±".magenta().bold(),
        ActionType::NoOp => " ".normal(),
    }
}

/// 変更計画を表示
pub fn print_plan(plan: &ChangeSet) {
    println!();
    for entry in &plan.entries {
        if entry.action == ActionType::NoOp && !entry.deferred {
            continue;
        }
        let mut line = format!("  {} {}", action_symbol(entry.action), entry.id);
        if !entry.changed.is_empty() && entry.action != ActionType::Create {
            line.push_str(&format!(" ({})", entry.changed.join(", ")).dimmed().to_string());
        }
        if let Some(mode) = entry.replace_mode
            && entry.action == ActionType::Replace
        {
            line.push_str(&format!(" [{:?}]", mode).dimmed().to_string());
        }
        if entry.deferred {
            line.push_str(&" (適用時に再評価)".dimmed().to_string());
        }
        println!("{}", line);
    }
    println!();
    println!("{} {}", "計画:".bold(), plan.summary());
}

/// 適用結果を表示
pub fn print_report(report: &ApplyReport) {
    println!();
    for result in &report.results {
        match &result.status {
            EntryStatus::Applied { action } => {
                println!("  {} {} {}", "✓".green(), result.id, action.to_string().dimmed());
            }
            EntryStatus::Unchanged => {}
            EntryStatus::Failed { error, tainted } => {
                println!("  {} {} {}", "✗".red(), result.id, error.red());
                if *tainted {
                    println!("    {}", "⚠ tainted: 次回の apply で置き換えられます".yellow());
                }
            }
            EntryStatus::Skipped { reason } => {
                println!("  {} {} {}", "-".yellow(), result.id, reason.dimmed());
            }
        }
    }
    println!();

    if report.is_success() {
        println!(
            "{}",
            format!("✓ 適用が完了しました ({}ms)", report.duration_ms)
                .green()
                .bold()
        );
    } else {
        println!(
            "{}",
            format!(
                "適用は一部失敗しました: 成功 {} / 失敗 {} / スキップ {}",
                report.succeeded().len(),
                report.failed().len(),
                report.skipped().len()
            )
            .red()
            .bold()
        );
        if report.cancelled {
            println!("{}", "中断されました".yellow());
        }
    }
}

/// Ctrl-C で apply を中断できるようにする
pub fn cancel_on_ctrl_c(engine: &Engine) {
    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                "中断しています... 実行中の処理の完了を待ちます".yellow()
            );
            cancel.cancel();
        }
    });
}
