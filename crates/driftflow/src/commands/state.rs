use crate::utils::Project;
use colored::Colorize;
use driftflow_engine::ResourceId;

pub async fn handle_list(project: &Project) -> anyhow::Result<()> {
    let snapshot = project.engine.store().snapshot().await?;
    println!(
        "ステート: {} (serial {})",
        project.settings.state_dir(&project.root).display().to_string().cyan(),
        snapshot.serial
    );

    if snapshot.is_empty() {
        println!("{}", "管理中のリソースはありません。".dimmed());
        return Ok(());
    }

    println!();
    for record in snapshot.iter() {
        let marker = if record.tainted {
            " (tainted)".red().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} {} v{}{}",
            record.id.to_string().bold(),
            record.provider.dimmed(),
            record.version,
            marker
        );
    }

    if let Some(lock) = project.engine.lock_info().await? {
        println!();
        println!(
            "{}",
            format!(
                "ロック中: {} ({} まで)",
                lock.holder,
                lock.expires_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            )
            .yellow()
        );
    }
    Ok(())
}

pub async fn handle_show(project: &Project, resource: &str) -> anyhow::Result<()> {
    let id: ResourceId = resource.parse()?;
    let record = project.engine.store().read(&id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
