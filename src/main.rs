use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use storyloom::cli::{Cli, split_paragraphs};
use storyloom::config::Config;
use storyloom::connection::manager::ConnectionStatus;
use storyloom::connection::transport::WsTransport;
use storyloom::fallback::HttpGenerationClient;
use storyloom::media::MediaKind;
use storyloom::playback::player::RodioPlayer;
use storyloom::session::{Session, SessionUpdate};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?
        .with_env_overrides();
    if let Some(url) = cli.url {
        config.service.ws_url = url;
    }
    if let Some(url) = cli.api_url {
        config.service.api_url = url;
    }
    if cli.no_audio {
        config.playback.autoplay = false;
    }

    let text = read_input(cli.file.as_deref())?;
    let paragraphs = split_paragraphs(&text);
    anyhow::ensure!(!paragraphs.is_empty(), "input contains no paragraphs");
    println!("Narrating {} paragraphs...", paragraphs.len());

    let transport = Arc::new(WsTransport::new(config.service.ws_url.clone()));
    let fallback = Arc::new(HttpGenerationClient::new(config.service.api_url.clone()));
    let volume = config.playback.volume;
    let (session, handle, mut updates) = Session::new(
        &config,
        transport,
        |events| Box::new(RodioPlayer::new(events).with_volume(volume)),
        Some(fallback),
    );
    let session_task = tokio::spawn(session.run());

    let mut submitted = false;
    let mut videos_requested: HashSet<u32> = HashSet::new();

    loop {
        let update = tokio::select! {
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted.");
                break;
            }
        };

        match update {
            SessionUpdate::Connection(status) => {
                println!("[connection] {status}");
                match status {
                    ConnectionStatus::Connected if !submitted => {
                        submitted = true;
                        handle.submit(paragraphs.clone()).await?;
                    }
                    ConnectionStatus::Failed if !submitted => {
                        // No stream; the session falls back to one-shot calls.
                        submitted = true;
                        handle.submit(paragraphs.clone()).await?;
                    }
                    ConnectionStatus::Failed => {
                        eprintln!(
                            "connection failed; run again or check the service endpoint"
                        );
                    }
                    _ => {}
                }
            }
            SessionUpdate::CacheUpdated(update) => {
                println!(
                    "[paragraph {}] {} ready",
                    update.paragraph, update.kind
                );
                if cli.video
                    && update.kind == MediaKind::Image
                    && videos_requested.insert(update.paragraph)
                {
                    let handle = handle.clone();
                    let paragraph = update.paragraph;
                    tokio::spawn(async move {
                        match handle.request_video(paragraph).await {
                            Ok(video) => {
                                println!("[paragraph {paragraph}] video at {}", video.url)
                            }
                            Err(e) => eprintln!("[paragraph {paragraph}] video failed: {e}"),
                        }
                    });
                }
            }
            SessionUpdate::Progress(progress) => {
                log::info!(
                    "paragraph {} {} {}%",
                    progress.paragraph,
                    progress.kind,
                    progress.percent
                );
            }
            SessionUpdate::Status { paragraph, message } => {
                log::info!("status (paragraph {paragraph:?}): {message}");
            }
            SessionUpdate::ParagraphError { paragraph, message } => {
                eprintln!("[paragraph {paragraph:?}] error: {message}");
            }
            SessionUpdate::Playback(state) => {
                log::debug!("playback: {state:?}");
            }
            SessionUpdate::TaskComplete => {
                println!("All paragraphs processed.");
                break;
            }
        }
    }

    let _ = handle.shutdown().await;
    let _ = session_task.await;
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            Ok(text)
        }
    }
}
