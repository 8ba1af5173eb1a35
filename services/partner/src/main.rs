use anyhow::{Context, Result};
use clap::Parser;
use partner_core::orchestrator::{OrchestratorHandle, SessionOrchestrator};
use partner_core::persona::Persona;
use partner_core::recorder::{LabelFont, Recorder, RecorderConfig};
use partner_core::transcription::TranscriptionSource;
use partner_service::config::Config;
use partner_service::console::{self, Command};
use partner_service::factory::LiveSessionFactory;
use partner_service::ffmpeg::{FFMPEG, FfmpegCamera, FfmpegEncoder};
use partner_service::microphone::CpalMicrophone;
use partner_service::persona_loader;
use partner_service::transcriber::{ConsoleTranscriber, MicTranscriber};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::fmt::time::ChronoLocal;

const PERSONA_DIR: &str = "personas";

#[derive(Parser)]
#[command(version, about = "Practice conversations with a streaming AI avatar")]
struct Cli {
    /// Type your side of the conversation instead of speaking it
    #[arg(long)]
    typed: bool,
    /// Leave the camera out of recordings
    #[arg(long)]
    no_camera: bool,
    /// Persona JSON file to start with (overrides PERSONA_FILE)
    #[arg(long)]
    persona: Option<PathBuf>,
    /// Microphone to capture from (see --list-devices)
    #[arg(long)]
    input_device: Option<String>,
    /// Print the available audio input devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Everything the command loop needs besides the orchestrator.
struct Console {
    handle: OrchestratorHandle,
    typed: Option<Arc<ConsoleTranscriber>>,
    personas: HashMap<String, Persona>,
    recordings_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Parse Command-Line Arguments ---
    let args = Cli::parse();
    if args.list_devices {
        println!("{}", partner_native_utils::device::get_available_inputs()?);
        return Ok(());
    }

    // --- 2. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 3. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting partner service...");

    // --- 4. Load Personas ---
    let personas = if Path::new(PERSONA_DIR).is_dir() {
        persona_loader::load_personas(Path::new(PERSONA_DIR))
            .context("Failed to load personas")?
    } else {
        HashMap::new()
    };
    tracing::info!("Loaded {} personas.", personas.len());
    let persona = match args.persona.as_ref().or(config.persona_file.as_ref()) {
        Some(path) => persona_loader::load_persona(path)?,
        None => Persona::default(),
    };
    tracing::info!("Starting persona: {}", persona.name);

    // --- 5. Speech Input ---
    let mut typed = None;
    let transcriber: Arc<dyn TranscriptionSource> = if args.typed {
        let typed_input = Arc::new(ConsoleTranscriber::new());
        typed = Some(typed_input.clone());
        typed_input
    } else {
        let mic = MicTranscriber::connect(
            config.openai_api_key.as_ref(),
            args.input_device.clone(),
        )
        .await;
        if mic.is_supported() {
            Arc::new(mic)
        } else {
            tracing::warn!("Microphone transcription unavailable, falling back to typed input.");
            let typed_input = Arc::new(ConsoleTranscriber::new());
            typed = Some(typed_input.clone());
            typed_input
        }
    };

    // --- 6. Camera and Recorder ---
    let camera = if args.no_camera {
        None
    } else {
        match FfmpegCamera::open(FFMPEG, config.camera_device.as_deref()) {
            Ok(camera) => Some(camera),
            Err(e) => {
                tracing::warn!("Camera unavailable, recording without it: {:#}", e);
                None
            }
        }
    };
    let recorder = Recorder::new(
        Arc::new(FfmpegEncoder::probe(FFMPEG).await),
        Arc::new(CpalMicrophone::new(args.input_device.clone())),
        RecorderConfig {
            label_font: LabelFont::discover(config.label_font.as_deref()).map(Arc::new),
            ..RecorderConfig::default()
        },
    );

    // --- 7. Orchestrator ---
    let factory = Arc::new(LiveSessionFactory::new(
        config.provider,
        config.heygen_api_key,
    ));
    let orchestrator = SessionOrchestrator::new(
        factory,
        transcriber,
        recorder,
        camera.as_ref().map(FfmpegCamera::source),
        persona,
        config.avatar,
    );
    let events = orchestrator.subscribe();
    let handle = orchestrator.handle();
    let runner = tokio::spawn(orchestrator.run());
    let printer = tokio::spawn(print_events(events));

    println!("{}", console::HELP);

    // --- 8. Command Loop ---
    let commands = Console {
        handle: handle.clone(),
        typed,
        personas,
        recordings_dir: config.recordings_dir,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down.");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read console input: {}", e);
                        break;
                    }
                };
                if commands.execute(Command::parse(&line)).await.is_break() {
                    break;
                }
            }
        }
    }

    // --- 9. Shutdown ---
    handle.shutdown().await;
    let _ = runner.await;
    printer.abort();
    drop(camera);
    tracing::info!("Partner service stopped.");
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<partner_core::orchestrator::SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = console::render_event(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("{} session events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl Console {
    async fn execute(&self, command: Command) -> ControlFlow<()> {
        let outcome = match command {
            Command::Empty => Ok(()),
            Command::Quit => return ControlFlow::Break(()),
            Command::Help => {
                println!("{}", console::HELP);
                Ok(())
            }
            Command::Start => self.handle.start_session().await,
            Command::End => self.handle.end_session().await,
            Command::Record => self
                .handle
                .start_recording()
                .await
                .map(|format| println!("[recording] {format}")),
            Command::StopRecording => self.handle.stop_recording().await.map(|artifact| {
                println!(
                    "[recording] stopped, {} bytes as {}",
                    artifact.len(),
                    artifact.format
                )
            }),
            Command::Save(dir) => self
                .handle
                .export_recording(dir.unwrap_or_else(|| self.recordings_dir.clone()))
                .await
                .map(|path| println!("[recording] saved to {}", path.display())),
            Command::Status => self
                .handle
                .status()
                .await
                .map(|status| println!("{}", console::render_status(&status))),
            Command::Persona(name) => {
                match persona_loader::resolve_persona(&name, &self.personas) {
                    Ok(persona) => {
                        let name = persona.name.clone();
                        self.handle
                            .set_persona(persona)
                            .await
                            .map(|()| println!("[persona] {name}"))
                    }
                    Err(e) => {
                        println!("[error] {e:#}");
                        Ok(())
                    }
                }
            }
            Command::Text(text) => {
                match &self.typed {
                    Some(typed) => {
                        if !typed.submit(&text) {
                            println!("[waiting] the partner is not listening right now");
                        }
                    }
                    None => println!("[hint] speak to the partner, or restart with --typed"),
                }
                Ok(())
            }
            Command::Unknown(line) => {
                println!("Unknown command: {line} (try /help)");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            println!("[error] {e}");
        }
        ControlFlow::Continue(())
    }
}
