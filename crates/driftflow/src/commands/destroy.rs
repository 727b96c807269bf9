use crate::utils::{self, Project};
use colored::Colorize;

pub async fn handle(project: &Project, yes: bool) -> anyhow::Result<()> {
    let plan = project.engine.plan_destroy().await?;
    if plan.is_empty() {
        println!("{}", "管理中のリソースはありません。".green());
        return Ok(());
    }
    utils::print_plan(&plan);

    if !yes {
        println!();
        println!(
            "{}",
            format!("警告: {} 個のリソースを削除します。", plan.len()).yellow()
        );
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    utils::cancel_on_ctrl_c(&project.engine);
    let report = project.engine.destroy().await?;
    utils::print_report(&report);
    report.into_result()?;
    Ok(())
}
