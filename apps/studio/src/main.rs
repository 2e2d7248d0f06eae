use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_client_config, studio::style_presets, ApprovedDesign, DesignListState, GeneratedImage,
    StudioContext, StudioSession, SyncPhase,
};
use shared::domain::{DesignMode, DocumentId};
use tokio::sync::watch;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "studio", about = "Generate and curate fashion and architecture designs")]
struct Cli {
    /// Config file; defaults to ./studio.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one design and save it to disk.
    Generate {
        #[arg(long, default_value = "")]
        prompt: String,
        /// Voice transcript appended to the prompt.
        #[arg(long)]
        transcript: Option<String>,
        #[arg(long, default_value = "fashion", value_parser = parse_mode)]
        mode: DesignMode,
        #[arg(long)]
        style: Option<String>,
        /// Sketch or photo to steer the render.
        #[arg(long)]
        reference: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Also save the result to the approved designs.
        #[arg(long)]
        approve: bool,
    },
    /// Print approved designs, newest first.
    List,
    /// Print the approved list every time it changes.
    Watch,
    Delete {
        id: String,
    },
    /// Print the style presets.
    Styles {
        #[arg(long, value_parser = parse_mode)]
        mode: Option<DesignMode>,
    },
}

fn parse_mode(raw: &str) -> Result<DesignMode, String> {
    DesignMode::parse(raw).ok_or_else(|| format!("unknown mode {raw:?}; use fashion or architecture"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Command::Styles { mode } = &cli.command {
        print_styles(*mode);
        return Ok(());
    }

    let config = load_client_config(cli.config.as_deref()).context("failed to load studio config")?;
    let context = StudioContext::init(&config)?;
    let result = run(&context, cli.command).await;
    context.shutdown().await;
    result
}

async fn run(context: &StudioContext, command: Command) -> Result<()> {
    match command {
        Command::Generate {
            prompt,
            transcript,
            mode,
            style,
            reference,
            out,
            approve,
        } => {
            let mut session = StudioSession::new();
            session.set_mode(mode);
            if let Some(style) = style {
                session.set_style(style);
            }
            session.set_prompt(prompt);
            if let Some(transcript) = transcript {
                session.apply_transcript(&transcript);
            }
            if let Some(reference) = reference {
                session.load_reference(&reference)?;
            }

            context.generate(&mut session).await?;
            let design = session
                .current_design()
                .cloned()
                .ok_or_else(|| anyhow!("generation finished without an image"))?;
            let path = out.unwrap_or_else(|| default_output_path(&design.image));
            save_image(&design.image, &path)?;
            println!("saved {}", path.display());

            if approve {
                context.sign_in().await?;
                let id = context.approve(&mut session).await?;
                println!("approved as {id}");
            }
        }
        Command::List => {
            context.sign_in().await?;
            let state = first_snapshot(context.designs()).await?;
            if state.designs.is_empty() {
                println!("no approved designs yet");
            }
            for design in &state.designs {
                print_design(design);
            }
        }
        Command::Watch => {
            context.sign_in().await?;
            let mut updates = WatchStream::new(context.designs());
            info!("watching approved designs; press Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    update = updates.next() => {
                        let Some(state) = update else { break };
                        print_update(&state);
                    }
                }
            }
        }
        Command::Delete { id } => {
            context.sign_in().await?;
            let mut session = StudioSession::new();
            let id = DocumentId(id);
            context.delete(&mut session, &id).await?;
            println!("deleted {id}");
        }
        Command::Styles { mode } => print_styles(mode),
    }
    Ok(())
}

async fn first_snapshot(mut designs: watch::Receiver<DesignListState>) -> Result<DesignListState> {
    let waited = tokio::time::timeout(
        FIRST_SNAPSHOT_TIMEOUT,
        designs.wait_for(|state| state.snapshots_applied > 0 || state.error.is_some()),
    )
    .await
    .context("timed out waiting for the design store")?;
    let state = waited.context("design sync stopped")?.clone();
    if let Some(error) = &state.error {
        bail!("design store error: {error}");
    }
    Ok(state)
}

fn print_update(state: &DesignListState) {
    match state.phase {
        SyncPhase::Authenticated => {}
        phase => {
            println!("-- {phase:?}");
            return;
        }
    }
    if let Some(error) = &state.error {
        println!("-- error: {error}");
        return;
    }
    println!("-- {} approved designs", state.designs.len());
    for design in &state.designs {
        print_design(design);
    }
}

fn print_design(design: &ApprovedDesign) {
    println!(
        "{}  {}  {:<12}  {:<14}  {}",
        design.id,
        design.created_at.format("%Y-%m-%d %H:%M"),
        design.mode,
        design.style,
        design.prompt
    );
}

fn print_styles(mode: Option<DesignMode>) {
    let modes = match mode {
        Some(mode) => vec![mode],
        None => vec![DesignMode::Fashion, DesignMode::Architecture],
    };
    for mode in modes {
        println!("{mode}:");
        for style in style_presets(mode) {
            println!("  {style}");
        }
    }
}

fn default_output_path(image: &GeneratedImage) -> PathBuf {
    let extension = match image.mime_type() {
        Some("image/jpeg") => "jpg",
        Some("image/webp") => "webp",
        _ => "png",
    };
    PathBuf::from(format!(
        "design-{}.{extension}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    ))
}

fn save_image(image: &GeneratedImage, path: &Path) -> Result<()> {
    let bytes = image.decode_bytes()?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_arguments() {
        let cli = Cli::try_parse_from([
            "studio",
            "generate",
            "--prompt",
            "a cantilevered house",
            "--mode",
            "architecture",
            "--approve",
        ])
        .expect("args");
        match cli.command {
            Command::Generate {
                prompt,
                mode,
                approve,
                reference,
                ..
            } => {
                assert_eq!(prompt, "a cantilevered house");
                assert_eq!(mode, DesignMode::Architecture);
                assert!(approve);
                assert!(reference.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_modes() {
        assert!(Cli::try_parse_from(["studio", "styles", "--mode", "sculpture"]).is_err());
    }

    #[test]
    fn output_extension_follows_image_mime() {
        let jpeg = GeneratedImage::from_base64(Some("image/jpeg"), "AAAA");
        assert!(default_output_path(&jpeg).to_string_lossy().ends_with(".jpg"));
        let png = GeneratedImage::from_base64(None, "AAAA");
        assert!(default_output_path(&png).to_string_lossy().ends_with(".png"));
    }
}
