//! `tasklane config`: show the effective configuration.

use std::path::Path;

use anyhow::Result;
use console::style;
use tasklane_infra::config::{load_config, render_config};

pub async fn show_config(path: &Path) -> Result<()> {
    let config = load_config(path).await;
    let source = if tokio::fs::try_exists(path).await.unwrap_or(false) {
        "loaded"
    } else {
        "not found, defaults"
    };

    println!("{}", style(format!("# {} ({source})", path.display())).dim());
    print!("{}", render_config(&config)?);
    Ok(())
}
