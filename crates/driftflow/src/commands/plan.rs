use crate::utils::{self, Project};
use colored::Colorize;
use std::path::Path;

pub async fn handle(project: &Project, file: &Path, destroy: bool, json: bool) -> anyhow::Result<()> {
    let plan = if destroy {
        project.engine.plan_destroy().await?
    } else {
        let declarations = project.load_manifest(file)?;
        project.engine.plan(declarations).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    if !plan.has_changes() {
        println!();
        println!("{}", "変更はありません。ステートは宣言と一致しています。".green());
        return Ok(());
    }

    utils::print_plan(&plan);
    Ok(())
}
