//! Terminal front end for a talk session.
//!
//! Enter toggles the session on and off, `q` quits. Talking transitions,
//! transcript lines and surfaced errors are printed as they happen.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use voicelink_core::{SessionCommand, SessionHandle, SessionState, SessionView, TranscriptEntry};

/// What a line typed at the prompt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Toggle,
    Quit,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        match line.trim().to_ascii_lowercase().as_str() {
            "q" | "quit" | "exit" => Input::Quit,
            _ => Input::Toggle,
        }
    }
}

/// The command a toggle maps to in the given session state.
pub fn toggle(state: SessionState) -> SessionCommand {
    match state {
        SessionState::Idle => SessionCommand::Engage,
        SessionState::Connecting | SessionState::Active | SessionState::Closing => {
            SessionCommand::Disengage
        }
    }
}

pub fn format_entry(entry: &TranscriptEntry) -> String {
    format!("{}: {}", entry.speaker, entry.content)
}

/// Reads commands from stdin until the user quits, stdin closes or Ctrl+C.
pub async fn run(handle: SessionHandle, view: SessionView) -> anyhow::Result<()> {
    let printer = tokio::spawn(print_updates(view.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Press Enter to start talking, Enter again to stop, q to quit.");
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match Input::parse(&line) {
            Input::Quit => break,
            Input::Toggle => {
                let command = toggle(*view.state.borrow());
                debug!(?command, "Console command.");
                if !handle.send(command).await {
                    break;
                }
            }
        }
    }

    handle.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_updates(mut view: SessionView) {
    let mut printed = view.transcript.borrow_and_update().len();
    view.talking.mark_unchanged();
    view.state.mark_unchanged();
    view.last_error.mark_unchanged();

    loop {
        tokio::select! {
            changed = view.state.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *view.state.borrow_and_update();
                match state {
                    SessionState::Active => println!("[connected, microphone live]"),
                    SessionState::Idle => println!("[idle]"),
                    SessionState::Connecting | SessionState::Closing => {}
                }
            }
            changed = view.talking.changed() => {
                if changed.is_err() {
                    return;
                }
                if *view.talking.borrow_and_update() {
                    println!("[assistant speaking]");
                } else {
                    println!("[assistant finished]");
                }
            }
            changed = view.transcript.changed() => {
                if changed.is_err() {
                    return;
                }
                let fresh: Vec<String> = {
                    let log = view.transcript.borrow_and_update();
                    log.iter().skip(printed).map(format_entry).collect()
                };
                printed += fresh.len();
                for line in fresh {
                    println!("{line}");
                }
            }
            changed = view.last_error.changed() => {
                if changed.is_err() {
                    return;
                }
                let error = view.last_error.borrow_and_update().clone();
                if let Some(error) = error {
                    eprintln!("error: {error}");
                }
            }
        }
    }
}
