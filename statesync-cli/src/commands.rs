//! Line-oriented commands read from stdin.

use std::io::{self, BufRead};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `<type> [json payload]`
    Commit { kind: String, payload: Value },
    State,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <type> [json]   commit a mutation, e.g. counter/increment {\"by\": 2}
  state           print the local state tree
  status          print sync status
  help            show this message
  quit            leave and exit";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word {
        "state" => Command::State,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        kind => {
            let payload = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest).map_err(|e| format!("bad payload: {}", e))?
            };
            Command::Commit {
                kind: kind.to_string(),
                payload,
            }
        }
    };
    Ok(Some(command))
}

/// Read stdin on a background thread so the process loop never blocks on it.
/// The channel disconnects at end of input.
pub fn spawn_stdin_reader() -> Receiver<Command> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || read_commands(io::stdin().lock(), tx));
    rx
}

fn read_commands<R: BufRead>(input: R, tx: Sender<Command>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("stdin read failed: {}", e);
                break;
            }
        };
        match parse_line(&line) {
            Ok(Some(command)) => {
                let quit = command == Command::Quit;
                if tx.send(command).is_err() || quit {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("{}", e),
        }
    }
}
