use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use facefeed_core::{AttemptId, ClientId, FrameTick, RetryDecision};
use facefeed_session::{CaptureOutcome, Session, SessionConfig, SessionEvent, SessionEvents};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facefeed", about = "Live face-search feed client")]
struct Cli {
    /// Face-search service base URL (overrides FACEFEED_SERVICE_URL)
    #[arg(long, global = true)]
    service_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the feed URL a new session would connect to first
    Endpoint,
    /// Stream the live feed and print frame statistics
    Watch {
        /// Stop after this many frames (0 = until interrupted)
        #[arg(short = 'n', long, default_value_t = 0)]
        frames: u64,
        /// Keep the latest still at this path
        #[arg(long)]
        save_frame: Option<PathBuf>,
    },
    /// Capture the current frame and search the gallery
    Capture {
        /// Wait until the feed reports a face before capturing
        #[arg(long)]
        wait_for_face: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = SessionConfig::from_env();
    if let Some(url) = cli.service_url {
        config.service_url = url;
    }

    match cli.command {
        Commands::Endpoint => {
            let attempt = AttemptId::new(ClientId::generate(), 1);
            let url = config
                .endpoint_for(&attempt)
                .context("invalid service URL")?;
            println!("{url}");
        }
        Commands::Watch { frames, save_frame } => {
            watch(config, frames, save_frame.as_deref()).await?;
        }
        Commands::Capture {
            wait_for_face,
            json,
        } => {
            capture(config, wait_for_face, json).await?;
        }
    }

    Ok(())
}

async fn watch(config: SessionConfig, limit: u64, save_frame: Option<&Path>) -> Result<()> {
    let (session, mut events) = Session::spawn(config);
    session.open().await.context("failed to open live feed")?;

    let mut seen = 0u64;
    let result = loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => break Ok(()),
        };
        let Some(event) = event else {
            break Err(anyhow!("session ended unexpectedly"));
        };

        match event {
            SessionEvent::Connecting { attempt } => println!("connecting ({attempt})"),
            SessionEvent::Connected { attempt } => println!("connected ({attempt})"),
            SessionEvent::Frame { sequence, tick, .. } => {
                seen += 1;
                if sequence == 1 || sequence % 30 == 0 {
                    println!(
                        "frame {sequence}: {} face(s), {}",
                        tick.faces_detected,
                        tick.fps
                            .map(|fps| format!("{fps:.1} fps"))
                            .unwrap_or_else(|| "fps unknown".into())
                    );
                }
                if let Some(path) = save_frame {
                    if let Err(err) = write_frame(path, &tick) {
                        break Err(err);
                    }
                }
                if limit > 0 && seen >= limit {
                    break Ok(());
                }
            }
            SessionEvent::Terminated {
                attempt,
                termination,
                message,
                decision,
            } => {
                println!("attempt {attempt} ended ({termination}): {message}");
                match decision {
                    RetryDecision::Retry { after, retry } => {
                        println!("retry {retry} in {} ms", after.as_millis());
                    }
                    RetryDecision::GiveUp(reason) => {
                        break Err(anyhow!("giving up after {termination} ({reason:?})"));
                    }
                }
            }
            SessionEvent::CaptureResolved { .. } | SessionEvent::Closed { .. } => {}
        }
    };

    if let Ok(snapshot) = session.snapshot().await {
        println!(
            "{seen} frame(s) received, {} retries used, {} dropped",
            snapshot.retries_used, snapshot.dropped_frames
        );
    }
    session.dispose().await;
    result
}

fn write_frame(path: &Path, tick: &FrameTick) -> Result<()> {
    let bytes = tick
        .image_bytes()
        .context("frame image is not valid base64")?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Wait for the handshake, and for a visible face when asked.
async fn wait_until_ready(events: &mut SessionEvents, wait_for_face: bool) -> Result<()> {
    let mut connected = false;
    while let Some(event) = events.next().await {
        match event {
            SessionEvent::Connected { attempt } => {
                tracing::info!(%attempt, "feed ready");
                if !wait_for_face {
                    return Ok(());
                }
                connected = true;
            }
            SessionEvent::Frame { tick, .. } if connected && tick.faces_detected > 0 => {
                return Ok(());
            }
            SessionEvent::Terminated {
                termination,
                message,
                decision: RetryDecision::GiveUp(_),
                ..
            } => bail!("connection failed ({termination}): {message}"),
            _ => {}
        }
    }
    bail!("session ended before the feed was ready")
}

async fn capture(config: SessionConfig, wait_for_face: bool, as_json: bool) -> Result<()> {
    let (session, mut events) = Session::spawn(config);
    session.open().await.context("failed to open live feed")?;

    let ready = tokio::select! {
        ready = wait_until_ready(&mut events, wait_for_face) => ready,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };
    ready?;

    let pending = session.capture().await.context("capture rejected")?;
    let attempt = pending.attempt().clone();
    let outcome = pending.await;
    session.close().await.context("failed to close session")?;
    session.dispose().await;

    if as_json {
        println!("{}", capture_json(&attempt, &outcome));
    } else {
        match &outcome {
            CaptureOutcome::Matched(matches) if matches.is_empty() => println!("no matches"),
            CaptureOutcome::Matched(matches) => {
                for descriptor in matches {
                    println!("{}", descriptor.path);
                }
            }
            CaptureOutcome::Failed { reason } => println!("search failed: {reason}"),
            CaptureOutcome::Abandoned(_) => {}
        }
    }

    if let CaptureOutcome::Abandoned(reason) = outcome {
        bail!("capture abandoned: {reason:?}");
    }
    Ok(())
}

fn capture_json(attempt: &AttemptId, outcome: &CaptureOutcome) -> serde_json::Value {
    let result = match outcome {
        CaptureOutcome::Matched(matches) => json!({
            "status": "matched",
            "matches": matches.iter().map(|m| m.path.as_str()).collect::<Vec<_>>(),
        }),
        CaptureOutcome::Failed { reason } => json!({"status": "failed", "reason": reason}),
        CaptureOutcome::Abandoned(reason) => {
            json!({"status": "abandoned", "reason": format!("{reason:?}")})
        }
    };
    json!({
        "client": attempt.client.as_str(),
        "attempt": attempt.number,
        "captured_at": chrono::Utc::now().to_rfc3339(),
        "result": result,
    })
}
