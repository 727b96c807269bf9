use crate::utils::{self, Project};
use colored::Colorize;
use std::path::Path;

pub async fn handle(project: &Project, file: &Path, yes: bool) -> anyhow::Result<()> {
    println!("{}", "変更を適用します...".blue().bold());
    let declarations = project.load_manifest(file)?;

    let plan = project.engine.plan(declarations.clone()).await?;
    if !plan.has_changes() {
        println!();
        println!("{}", "変更はありません。".green());
        return Ok(());
    }
    utils::print_plan(&plan);

    // 確認（--yesが指定されていない場合）
    if !yes {
        println!();
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    // ロック取得後に再計画してから適用する
    utils::cancel_on_ctrl_c(&project.engine);
    let report = project.engine.apply(declarations).await?;
    utils::print_report(&report);
    report.into_result()?;
    Ok(())
}
