use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use live_coach::live::{GeminiLive, OutboundSender};
use live_coach::voice::{
    AudioFrame, AudioInput, CaptureHandle, CpalInput, CpalOutput, INPUT_SAMPLE_RATE, LevelMeter,
    OUTPUT_SAMPLE_RATE, PlaybackEvent, PlaybackScheduler, samples_to_wav,
};
use live_coach::{Config, ContentClient, ControllerHandle, SessionController, SessionState};

/// Coach - realtime voice assistant and product content helper
#[derive(Parser)]
#[command(name = "coach", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Talk to the live voice assistant (default)
    Live,
    /// Test microphone capture
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output and gapless scheduling
    TestSpeaker,
    /// Write marketing copy for a product photo
    Caption {
        /// Product image
        image: PathBuf,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Produce an enhanced product photo
    Enhance {
        /// Product image
        image: PathBuf,
        /// Where to write the enhanced image
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,live_coach=info",
        1 => "info,live_coach=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Live) {
        Command::Live => live().await,
        Command::TestMic { duration, save } => test_mic(duration, save.as_deref()).await,
        Command::TestSpeaker => test_speaker().await,
        Command::Caption { image, json } => caption(&image, json).await,
        Command::Enhance { image, output } => enhance(&image, &output).await,
    }
}

/// Run a voice conversation driven from stdin
#[allow(clippy::future_not_send)]
async fn live() -> anyhow::Result<()> {
    let config = Config::load();
    let live_config = config.live_config()?;
    tracing::debug!(?config, "loaded configuration");

    let transport = Arc::new(GeminiLive::new(live_config));
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let output = CpalOutput::open(playback_tx)?;

    let controller =
        SessionController::new(transport, Box::new(CpalInput), Box::new(output), playback_rx)
            .start_muted(config.live.start_muted);
    let handle = controller.handle();

    tokio::spawn(report_status(handle.clone()));

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            let _ = ctrl_c.shutdown();
        }
    });

    // Blocking stdin reads stay off the runtime so exit never waits on them
    let stdin = handle.clone();
    std::thread::spawn(move || read_commands(&stdin));

    println!("Commands: start, stop, mute, unmute, status, quit");
    handle.open_session()?;

    controller.run().await;
    Ok(())
}

fn read_commands(handle: &ControllerHandle) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let sent = match line.trim() {
            "" => Ok(()),
            "start" => handle.open_session(),
            "stop" => handle.close_session(),
            "mute" => handle.mute(true),
            "unmute" => handle.mute(false),
            "status" => {
                let status = handle.status();
                println!(
                    "state: {} | muted: {} | level: {:.3}{}",
                    status.state,
                    status.muted,
                    handle.volume_level(),
                    status
                        .last_error
                        .map(|e| format!(" | error: {e}"))
                        .unwrap_or_default()
                );
                Ok(())
            }
            "quit" | "exit" => break,
            other => {
                println!("unknown command: {other} (start, stop, mute, unmute, status, quit)");
                Ok(())
            }
        };
        if sent.is_err() {
            return;
        }
    }
    let _ = handle.shutdown();
}

async fn report_status(handle: ControllerHandle) {
    let mut status = handle.subscribe();
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        match &current.last_error {
            Some(error) if current.state == SessionState::Error => {
                println!("[{}] {error} Type 'start' to retry.", current.state);
            }
            _ => println!("[{}]{}", current.state, if current.muted { " (muted)" } else { "" }),
        }
        if current.state == SessionState::Closed {
            break;
        }
    }
}

/// Test microphone input through the capture pipeline
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64, save: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let device = CpalInput.acquire()?;
    println!("Device rate: {} Hz, sending at {INPUT_SAMPLE_RATE} Hz", device.sample_rate());
    println!("---");

    let (outbound, mut blocks) = OutboundSender::channel(1024);
    let level = LevelMeter::new();
    let mut capture = CaptureHandle::start(device, outbound.clone(), level.clone())?;

    let mut recorded = Vec::new();
    let mut received = 0_usize;

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        while let Ok(envelope) = blocks.try_recv() {
            received += 1;
            if save.is_some() {
                let frame = envelope.decode_audio(INPUT_SAMPLE_RATE, 1)?;
                recorded.extend(frame.to_f32());
            }
        }

        let current = level.get();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (current * 200.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] level: {current:.4} | blocks: {received:4} | [{meter}]", i + 1);
    }

    capture.stop();

    if outbound.dropped_frames() > 0 {
        println!("dropped {} blocks", outbound.dropped_frames());
    }

    if let Some(path) = save {
        let wav = samples_to_wav(&recorded, INPUT_SAMPLE_RATE)?;
        tokio::fs::write(path, wav).await?;
        println!("Saved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the level stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with three tones scheduled back-to-back
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gaps between them\n");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let output = CpalOutput::open(events_tx)?;
    let mut scheduler = PlaybackScheduler::new(Box::new(output));

    for frequency in [440.0_f32, 554.37, 659.25] {
        let frame = AudioFrame::from_f32(&tone(frequency, 0.6), OUTPUT_SAMPLE_RATE, 1);
        if let Some(unit) = scheduler.enqueue(&frame)? {
            println!(
                "{frequency:>7.2} Hz: start {:.3}s, duration {:.3}s",
                unit.start_time, unit.duration
            );
        }
    }

    while scheduler.active_len() > 0 {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(PlaybackEvent::Ended(id))) => {
                scheduler.on_unit_ended(id);
            }
            Ok(Some(PlaybackEvent::Failed(reason))) => anyhow::bail!("playback failed: {reason}"),
            Ok(None) | Err(_) => anyhow::bail!("playback did not finish"),
        }
    }

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Sine tone at 30% volume
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tone(frequency: f32, seconds: f32) -> Vec<f32> {
    let rate = OUTPUT_SAMPLE_RATE as f32;
    let len = (rate * seconds) as usize;
    (0..len)
        .map(|i| (2.0 * std::f32::consts::PI * frequency * i as f32 / rate).sin() * 0.3)
        .collect()
}

async fn caption(image: &Path, json: bool) -> anyhow::Result<()> {
    let client = ContentClient::from_config(&Config::load())?;
    let bytes = tokio::fs::read(image).await?;
    let mime_type = live_coach::content::image_mime_type(image);

    let content = client.generate_post_content(&bytes, mime_type).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&content)?);
        return Ok(());
    }

    println!("{}", content.product_name);
    println!("{}\n", content.tagline);
    println!("Caption:\n{}\n", content.short_caption);
    println!("Story:\n{}\n", content.promotional_caption);
    println!("Hashtags: {}", content.hashtags);
    println!("Audience: {}", content.audience);
    println!("Ideas: {}", content.alternatives);
    Ok(())
}

async fn enhance(image: &Path, output: &Path) -> anyhow::Result<()> {
    let client = ContentClient::from_config(&Config::load())?;
    let bytes = tokio::fs::read(image).await?;
    let mime_type = live_coach::content::image_mime_type(image);

    let enhanced = client.generate_enhanced_image(&bytes, mime_type).await?;
    tokio::fs::write(output, enhanced.to_bytes()?).await?;

    println!(
        "Wrote {} ({}, suggested extension .{})",
        output.display(),
        enhanced.mime_type,
        live_coach::content::image_extension(&enhanced.mime_type)
    );
    Ok(())
}
