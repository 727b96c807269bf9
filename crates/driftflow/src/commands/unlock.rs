use crate::utils::Project;
use colored::Colorize;

pub async fn handle(project: &Project, yes: bool) -> anyhow::Result<()> {
    let Some(info) = project.engine.lock_info().await? else {
        println!("{}", "ロックはかかっていません。".green());
        return Ok(());
    };

    println!("保持者: {}", info.holder.cyan());
    println!("取得日時: {}", info.acquired_at);
    println!("期限: {}", info.expires_at);

    if !yes {
        println!();
        println!(
            "{}",
            "警告: 実行中の apply が存在する場合、ステートが壊れる可能性があります。".yellow()
        );
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    if project.engine.force_unlock().await? {
        println!("{}", "✓ ロックを解除しました".green());
    }
    Ok(())
}
