//! PCM Stream Client
//!
//! Connects to the audio peer, records one clip, then plays it back.
//!
//! Usage: `pcm-client [--config PATH] [HOST:PORT]`

use anyhow::{bail, Context, Result};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_stream_client::{
    audio::{list_output_devices, CaptureOutcome},
    config::AppConfig,
    task::ProgressEvent,
    AudioClient,
};

struct Args {
    config: Option<PathBuf>,
    peer: Option<(String, u16)>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        peer: None,
    };
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config needs a path")?;
            args.config = Some(PathBuf::from(path));
        } else {
            let (host, port) = arg
                .rsplit_once(':')
                .with_context(|| format!("Invalid peer address: {}", arg))?;
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in {}", arg))?;
            args.peer = Some((host.to_string(), port));
        }
    }

    Ok(args)
}

fn print_progress(label: &str, event: &ProgressEvent) {
    match event {
        ProgressEvent::Status(message) => println!("{}", message),
        ProgressEvent::Percent(p) => {
            print!("\r{}... {}%", label, p);
            let _ = std::io::stdout().flush();
        }
        ProgressEvent::NotConnected => println!("\nError: Not connected"),
        ProgressEvent::TimedOut => println!("\nError: Recording timed out"),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PCM stream client");

    let args = parse_args()?;
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some((host, port)) = args.peer {
        config.network.host = host;
        config.network.port = port;
    }
    config.validate()?;

    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let format = config.capture.format();
    let client = AudioClient::new(config);

    // Connect
    let connect = client.connect()?;
    for event in connect.progress().iter() {
        print_progress("Connecting", &event);
    }
    match connect.join()? {
        Ok(addr) => println!("Connected to {}", addr),
        Err(e) => {
            println!("Connection failed");
            return Err(e.into());
        }
    }

    // Record
    let record = client.start_recording()?;
    let cancel = record.cancel_token();
    println!("Recording... press Enter to stop");
    thread::Builder::new()
        .name("stdin-stop".into())
        .spawn(move || {
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).is_ok() {
                cancel.cancel();
            }
        })?;

    for event in record.progress().iter() {
        print_progress("Recording", &event);
    }
    println!();

    let report = match record.join()? {
        Ok(report) => report,
        Err(e) => {
            println!("Recording failed: {}", e);
            return Err(e.into());
        }
    };

    match &report.outcome {
        CaptureOutcome::Completed { saved_to } => {
            println!(
                "Recording complete: {:?} of audio ({} bytes in {:?})",
                format.duration_of(report.bytes_received),
                report.bytes_received,
                report.elapsed
            );
            match saved_to {
                Some(path) => println!("Saved to {}", path.display()),
                None => println!("Recording was not saved"),
            }
        }
        CaptureOutcome::Stopped => {
            println!("Recording stopped");
            return Ok(());
        }
    }

    // Play
    let playback = client.start_playback()?;
    for event in playback.progress().iter() {
        print_progress("Playing", &event);
    }
    println!();

    match playback.join()? {
        Ok(report) => println!("Playback complete ({} bytes)", report.bytes_written),
        Err(e) => bail!("Playback failed: {}", e),
    }

    client.disconnect()?;
    Ok(())
}
