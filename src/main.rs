use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use kitchen_voice::backend::{Backend, HttpBackend};
use kitchen_voice::config::InputKind;
use kitchen_voice::presentation::format_reply;
use kitchen_voice::voice::{
    Microphone, SAMPLE_RATE, calculate_energy, decode_mp3, play_samples, tone,
};
use kitchen_voice::{Config, Control, Daemon};

/// Kitchen voice - hands-free voice controller for the kitchen assistant
#[derive(Parser)]
#[command(name = "kitchen-voice", version, about)]
struct Cli {
    /// Config file (default: ~/.config/kitchen-voice/config.toml)
    #[arg(short, long, env = "KITCHEN_CONFIG")]
    config: Option<PathBuf>,

    /// Disable wake phrase listening; only the toggle starts a conversation
    #[arg(long)]
    manual: bool,

    /// Wake phrase
    #[arg(long)]
    wake_phrase: Option<String>,

    /// Conversational backend URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Input engine: mic or text
    #[arg(long)]
    input: Option<InputKind>,

    /// Never play audio; replies are text only
    #[arg(long)]
    mute: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Send one question to the backend and print the reply
    Ask {
        /// Question to ask
        text: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,kitchen_voice=info",
        1 => "info,kitchen_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.manual {
        config.wake.enabled = false;
    }
    if let Some(phrase) = cli.wake_phrase {
        config.wake.phrase = phrase;
    }
    if let Some(url) = cli.backend_url {
        config.backend.url = url;
    }
    if let Some(input) = cli.input {
        config.recognition.input = input;
    }
    if cli.mute {
        config.audio.mute = true;
    }
    config.validate()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Ask { text } => ask(&config, &text).await,
        };
    }

    let (control_tx, control_rx) = mpsc::channel(16);
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let text_input = config.recognition.input == InputKind::Text;

    tokio::spawn(read_console(control_tx.clone(), line_tx, text_input));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control_tx.send(Control::Shutdown).await;
        }
    });

    if text_input {
        println!("Type to speak. Controls: /toggle /start /stop /quit");
    } else {
        println!("Press Enter to start or stop a conversation, q to quit");
    }

    let mut daemon = Daemon::from_config(&config, text_input.then_some(line_rx))?;
    daemon.run(control_rx).await?;
    Ok(())
}

/// Route console lines to controls or, in text mode, to the recognizer
async fn read_console(
    controls: mpsc::Sender<Control>,
    typed: mpsc::UnboundedSender<String>,
    text_input: bool,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let control = if text_input {
            match line {
                "/toggle" => Some(Control::Toggle),
                "/start" => Some(Control::Activate),
                "/stop" => Some(Control::Stop),
                "/quit" => Some(Control::Shutdown),
                other if other.starts_with('/') => {
                    println!("Unknown control '{other}'");
                    None
                }
                other => {
                    if typed.send(other.to_string()).is_err() {
                        break;
                    }
                    None
                }
            }
        } else {
            match line {
                "" => Some(Control::Toggle),
                "q" | "quit" => Some(Control::Shutdown),
                "stop" => Some(Control::Stop),
                _ => None,
            }
        };

        if let Some(control) = control {
            if controls.send(control).await.is_err() {
                break;
            }
        }
    }

    let _ = controls.send(Control::Shutdown).await;
}

async fn ask(config: &Config, text: &str) -> anyhow::Result<()> {
    let backend = HttpBackend::new(&config.backend)?;
    println!("Asking {}...\n", backend.url());

    let reply = backend.send(text).await?;
    println!("You asked: {text}\n\nKitchen Assistant:\n{}\n", format_reply(&reply.text));

    match reply.audio {
        Some(audio) if !config.audio.mute => {
            let (samples, rate) = decode_mp3(&audio)?;
            println!("Playing {} samples at {rate} Hz...", samples.len());
            tokio::task::spawn_blocking(move || play_samples(&samples, rate, &AtomicBool::new(false)))
                .await??;
        }
        Some(_) => println!("(audio muted)"),
        None => println!("(reply has no audio)"),
    }

    Ok(())
}

async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut microphone = Microphone::open()?;
    let chunks = microphone.listen()?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples: Vec<f32> = chunks.try_iter().flatten().collect();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    microphone.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 1 second.\n");

    let samples = tone(440.0, Duration::from_secs(1), 24_000);
    tokio::task::spawn_blocking(move || play_samples(&samples, 24_000, &AtomicBool::new(false)))
        .await??;

    println!("Done! If you didn't hear anything, check:");
    println!("  1. Is your speaker/headphones connected?");
    println!("  2. Run: pactl info | grep 'Default Sink'");
    println!("  3. Is the volume up?");

    Ok(())
}
