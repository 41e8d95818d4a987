//! Line-based console front end.
//!
//! Reads commands from stdin and forwards them to a spawned controller,
//! printing every state change, live cuff pressure and completed reading.

use crate::domain::history::ReadingStore;
use crate::domain::models::{ControllerCommand, DeviceState, Reading};
use crate::infrastructure::bluetooth::ControllerHandle;
use anyhow::Result;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub const HELP: &str = "commands: connect, measure, stop, disconnect, history, clear, clear-error, quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Controller(ControllerCommand),
    History,
    Clear,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let command = match line.trim().to_lowercase().as_str() {
            "connect" | "c" => Self::Controller(ControllerCommand::Connect),
            "measure" | "m" | "start" => Self::Controller(ControllerCommand::StartMeasurement),
            "stop" | "s" => Self::Controller(ControllerCommand::StopMeasurement),
            "disconnect" | "d" => Self::Controller(ControllerCommand::Disconnect),
            "clear-error" => Self::Controller(ControllerCommand::ClearError),
            "history" | "h" => Self::History,
            "clear" => Self::Clear,
            "help" | "?" => Self::Help,
            "quit" | "q" | "exit" => Self::Quit,
            other => return Err(format!("unknown command {:?}", other)),
        };
        Ok(command)
    }
}

pub fn describe_state(state: &DeviceState) -> String {
    let name = state.device_name.as_deref().unwrap_or("cuff");
    let phase = if state.measuring {
        format!("measuring on {}", name)
    } else if state.connected {
        format!("connected to {}", name)
    } else if state.connecting {
        format!("connecting to {}", name)
    } else if state.scanning {
        "scanning".to_string()
    } else {
        "idle".to_string()
    };
    match &state.error {
        Some(error) => format!("[{}] error: {}", phase, error),
        None => format!("[{}]", phase),
    }
}

pub fn describe_reading(reading: &Reading) -> String {
    format!(
        "{}  {}{}",
        reading.timestamp.format("%Y-%m-%d %H:%M"),
        reading,
        if reading.synced { "" } else { "  (not synced)" }
    )
}

/// Run until `quit` or end of input, then shut the controller down
pub async fn run(handle: ControllerHandle, store: Arc<Mutex<ReadingStore>>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = handle.state();
    let mut reading = handle.current_reading();
    let mut progress = handle.progress();

    println!("{}", HELP);
    println!("{}", describe_state(&state.borrow_and_update()));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(ConsoleCommand::Controller(command)) => handle.send(command)?,
                    Ok(ConsoleCommand::History) => print_history(&store),
                    Ok(ConsoleCommand::Clear) => clear_history(&store),
                    Ok(ConsoleCommand::Help) => println!("{}", HELP),
                    Err(e) => println!("{}; {}", e, HELP),
                }
            }
            Ok(()) = state.changed() => {
                println!("{}", describe_state(&state.borrow_and_update()));
            }
            Ok(()) = reading.changed() => {
                if let Some(reading) = reading.borrow_and_update().as_ref() {
                    println!("reading: {}", reading);
                }
            }
            Ok(()) = progress.changed() => {
                let pressure = *progress.borrow_and_update();
                if pressure > 0 {
                    println!("cuff pressure {} mmHg", pressure);
                }
            }
        }
    }

    info!("Console closed, shutting down");
    handle.shutdown().await;
    Ok(())
}

fn print_history(store: &Mutex<ReadingStore>) {
    let Ok(store) = store.lock() else {
        warn!("Reading store lock poisoned");
        return;
    };
    if store.is_empty() {
        println!("no readings yet");
        return;
    }
    for reading in store.list() {
        println!("{}", describe_reading(&reading));
    }
}

fn clear_history(store: &Mutex<ReadingStore>) {
    match store.lock() {
        Ok(mut store) => match store.clear() {
            Ok(()) => println!("history cleared"),
            Err(e) => println!("could not clear history: {}", e),
        },
        Err(_) => warn!("Reading store lock poisoned"),
    }
}
