//! Line commands for the interactive console.

use partner_core::orchestrator::{SessionEvent, SessionStatus};
use std::path::PathBuf;

pub const HELP: &str = "\
Commands:
  /start              start a practice session
  /end                end the current session
  /record             start recording you and the partner side by side
  /stop               stop recording
  /save [dir]         export the last recording (default: RECORDINGS_DIR)
  /persona <name|file> switch persona
  /status             show session status
  /help               show this help
  /quit               exit
Anything else is spoken to the partner when typed input is enabled.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    End,
    Record,
    StopRecording,
    Save(Option<PathBuf>),
    Persona(String),
    Status,
    Help,
    Quit,
    Text(String),
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Text(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name.to_ascii_lowercase().as_str(), arg) {
            ("start", _) => Command::Start,
            ("end", _) => Command::End,
            ("record", _) => Command::Record,
            ("stop", _) => Command::StopRecording,
            ("save", "") => Command::Save(None),
            ("save", dir) => Command::Save(Some(PathBuf::from(dir))),
            ("persona", "") => Command::Unknown(line.to_string()),
            ("persona", name) => Command::Persona(name.to_string()),
            ("status", _) => Command::Status,
            ("help" | "?", _) => Command::Help,
            ("quit" | "exit", _) => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

/// One line per event, or `None` for events not worth printing.
pub fn render_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::StateChanged(state) => Some(format!("[session] {state:?}")),
        SessionEvent::GateChanged(true) => Some("[listening]".to_string()),
        SessionEvent::GateChanged(false) => None,
        SessionEvent::UserSaid(text) => Some(format!("you: {text}")),
        SessionEvent::PartnerSaid(text) => Some(format!("partner: {text}")),
        SessionEvent::Elapsed(seconds) if seconds % 60 == 0 && *seconds > 0 => {
            Some(format!("[elapsed] {}", format_elapsed(*seconds)))
        }
        SessionEvent::Elapsed(_) => None,
        SessionEvent::Error(message) => Some(format!("[error] {message}")),
    }
}

pub fn format_elapsed(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

pub fn render_status(status: &SessionStatus) -> String {
    format!(
        "state: {:?} ({})\npersona: {}\navatar: {:?}{}\ndialogue: {:?} via {} ({} turns)\ntranscription: {:?}\nrecording: {}{}",
        status.state,
        format_elapsed(status.elapsed_seconds),
        status.persona,
        status.avatar,
        if status.avatar_speaking { ", speaking" } else { "" },
        status.dialogue,
        status.provider.unwrap_or("-"),
        status.turns,
        status.transcription,
        if status.recording { "on" } else { "off" },
        if status.artifact_ready { ", artifact ready" } else { "" },
    )
}
