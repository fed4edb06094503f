//! kaal-compose - compose the static capability distribution of a KaaL system
//!
//! Usage:
//!   kaal-compose --config compose.toml --out-dir build/compose
//!
//! Both arguments fall back to the `CONFIG` and `OUT_DIR` environment
//! variables, so the tool can run from a build script.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;

use kaal_compose::config::{CONFIG_ENV, OUT_DIR_ENV};
use kaal_compose::{ComposeConfig, Composition, ElfComponent, Summary};

#[derive(Parser, Debug)]
#[command(name = "kaal-compose")]
#[command(version)]
#[command(about = "Compose the static capability distribution of a KaaL system", long_about = None)]
struct Args {
    /// Composition config (TOML, or JSON with a .json extension)
    #[arg(long, env = CONFIG_ENV)]
    config: PathBuf,

    /// Directory for the spec, runtime configs and links
    #[arg(long, env = OUT_DIR_ENV)]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("Config:  {}", args.config.display());
    log::info!("Output:  {}", args.out_dir.display());

    let config = ComposeConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let mut composition =
        Composition::from_config(&config, &args.out_dir).context("Invalid composition config")?;

    let names: Vec<String> = config.components.keys().cloned().collect();
    let summary = composition
        .run(|c| {
            for name in &names {
                c.component(|ctx| ElfComponent::new(ctx, name))?;
            }
            Ok(())
        })
        .context("Composition failed")?;

    print_summary(&summary, &composition);
    Ok(())
}

fn print_summary(summary: &Summary, composition: &Composition) {
    println!(
        "{} Composed {} components ({} objects, {} files)",
        "✅".green(),
        summary.components.to_string().bold(),
        summary.objects,
        summary.files
    );
    if let Some(platform) = composition.context().kernel_config().platform() {
        println!("  Platform:       {}", platform);
    }
    if summary.asid_pools > 0 {
        println!("  ASID pools:     {}", summary.asid_pools);
    }
    if let Some(report) = &summary.untyped {
        println!(
            "  Untyped roots:  {} ({} objects covered, {} spare chunks)",
            report.roots.len(),
            report.covered,
            report.spares.len()
        );
    }
    println!("  Spec:           {}", composition.out_dir().join("spec.cdl").display());
}
