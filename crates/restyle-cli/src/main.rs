use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use restyle_contracts::assets::LocalAsset;
use restyle_contracts::events::EventWriter;
use restyle_contracts::styles::StyleCatalog;
use restyle_engine::{PipelineConfig, PipelineOutput, StylePipeline};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "restyle", version, about = "Restyle a photo with a reference style image")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Styles(StylesArgs),
    Generate(GenerateArgs),
}

#[derive(Debug, Parser)]
struct StylesArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Style id; the identity style when omitted.
    #[arg(long)]
    style: Option<String>,
    /// Subject image as a path or `file://` URI.
    #[arg(long)]
    subject: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    documents_dir: Option<PathBuf>,
    #[arg(long)]
    bundle_dir: Option<PathBuf>,
    #[arg(long)]
    install_dir: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// `replicate` or `dryrun`.
    #[arg(long)]
    provider: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("restyle error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Styles(args) => run_styles(args),
        Command::Generate(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed starting async runtime")?;
            runtime.block_on(run_generate(args))
        }
    }
}

fn run_styles(args: StylesArgs) -> Result<i32> {
    let catalog = StyleCatalog::default();
    if args.json {
        let rows: Vec<Value> = catalog
            .list()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    for style in catalog.list() {
        let marker = if style.is_identity { " (identity)" } else { "" };
        println!("{}\t{}{marker}", style.id, style.display_name);
    }
    Ok(0)
}

fn resolve_config(args: &GenerateArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if let Some(dir) = &args.documents_dir {
        config.documents_dir = dir.clone();
    }
    if let Some(dir) = &args.bundle_dir {
        config.bundle_dir = dir.clone();
    }
    if let Some(dir) = &args.install_dir {
        config.install_dir = dir.clone();
    }
    if let Some(provider) = &args.provider {
        config.provider = provider.trim().to_ascii_lowercase();
    }
    Ok(config)
}

async fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = resolve_config(&args)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| config.documents_dir.join("events.jsonl"));
    let session_id = uuid::Uuid::new_v4().to_string();

    let pipeline = StylePipeline::from_config(&config, StyleCatalog::default())?
        .with_events(EventWriter::new(events_path, session_id));
    if let Some(style) = &args.style {
        pipeline.select_style(style.trim());
    }

    let mut states = pipeline.subscribe();
    let progress = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            eprintln!("restyle: {state}");
        }
    });

    let subject = LocalAsset::parse(args.subject.trim());
    let outcome = pipeline.generate_selected(&subject).await;
    drop(pipeline);
    let _ = progress.await;

    let output = outcome.context("generation failed")?;
    match &output {
        PipelineOutput::Original(asset) => println!("{}", asset.uri()),
        PipelineOutput::Generated(result) => println!("{}", result.local_result_path.display()),
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_flags_override_loaded_config() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let config_path = temp.path().join("restyle.json");
        std::fs::write(&config_path, r#"{"documents_dir": "/from/file", "provider": "replicate"}"#)?;

        let cli = Cli::try_parse_from([
            "restyle",
            "generate",
            "--subject",
            "file:///a.jpg",
            "--style",
            "pirate",
            "--config",
            config_path.to_str().unwrap_or_default(),
            "--documents-dir",
            "/from/flag",
            "--provider",
            "DryRun",
        ])?;
        let Command::Generate(args) = cli.command else {
            anyhow::bail!("expected generate subcommand");
        };
        let config = resolve_config(&args)?;
        assert_eq!(config.documents_dir, PathBuf::from("/from/flag"));
        assert_eq!(config.provider, "dryrun");
        assert_eq!(args.style.as_deref(), Some("pirate"));
        Ok(())
    }

    #[test]
    fn style_is_optional() -> Result<()> {
        let cli = Cli::try_parse_from(["restyle", "generate", "--subject", "/a.jpg"])?;
        let Command::Generate(args) = cli.command else {
            anyhow::bail!("expected generate subcommand");
        };
        assert!(args.style.is_none());
        Ok(())
    }
}
