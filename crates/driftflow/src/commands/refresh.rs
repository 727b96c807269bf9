use crate::utils::Project;
use colored::Colorize;

pub async fn handle(project: &Project) -> anyhow::Result<()> {
    println!("{}", "実リソースを読み取っています...".blue());
    let report = project.engine.refresh().await?;

    println!();
    for id in &report.drifted {
        println!("  {} {} {}", "~".yellow().bold(), id, "ドリフトを検出".dimmed());
    }
    for id in &report.removed {
        println!("  {} {} {}", "-".red().bold(), id, "リモートに存在しません".dimmed());
    }
    for (id, error) in &report.failed {
        println!("  {} {} {}", "✗".red(), id, error.red());
    }

    if report.is_clean() {
        println!(
            "{}",
            format!("✓ {} 個のリソースはステートと一致しています", report.unchanged.len()).green()
        );
    } else {
        println!();
        println!(
            "ドリフト {} / 削除済み {} / 失敗 {}",
            report.drifted.len(),
            report.removed.len(),
            report.failed.len()
        );
    }

    if !report.failed.is_empty() {
        anyhow::bail!("{} 個のリソースを読み取れませんでした", report.failed.len());
    }
    Ok(())
}
