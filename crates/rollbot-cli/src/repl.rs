//! REPL – line commands for driving the toy by hand.
//!
//!   power on|off            – connect and wake, or sleep and disconnect
//!   drive <speed> <heading> [ms]
//!   stop
//!   led <r> <g> <b>
//!   estop [reason]
//!   clear                   – clear the estop
//!   send <json>             – route a raw JSON command
//!   status                  – print telemetry
//!   help
//!   quit | exit

use std::io::{self, BufRead, Write};

use colored::Colorize;
use rollbot_runtime::Dispatcher;
use rollbot_types::{Ack, Action, Command, Rgb, RollError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    /// A command routed through the dispatcher.
    Core(Command),
    Status,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid json command: {0}")]
    Json(String),
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<ReplCommand>, ParseError> {
    let line = line.trim();
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let cmd = match head.to_ascii_lowercase().as_str() {
        "power" => match args.as_slice() {
            ["on"] => core(Action::Power { on: true }),
            ["off"] => core(Action::Power { on: false }),
            _ => return Err(ParseError::Usage("power on|off")),
        },
        "drive" => {
            const USAGE: &str = "drive <speed> <heading> [ms]";
            let nums = numbers(&args).ok_or(ParseError::Usage(USAGE))?;
            match nums.as_slice() {
                [speed, heading] => core(Action::Drive {
                    speed: *speed,
                    heading: *heading,
                    duration_ms: None,
                }),
                [speed, heading, ms] => core(Action::Drive {
                    speed: *speed,
                    heading: *heading,
                    duration_ms: Some(*ms),
                }),
                _ => return Err(ParseError::Usage(USAGE)),
            }
        }
        "stop" => core(Action::Stop),
        "led" => {
            const USAGE: &str = "led <r> <g> <b> (0-255)";
            let rgb: Vec<u8> = args
                .iter()
                .map(|a| a.parse::<u8>())
                .collect::<Result<_, _>>()
                .map_err(|_| ParseError::Usage(USAGE))?;
            match rgb.as_slice() {
                [r, g, b] => core(Action::Led(Rgb::new(*r, *g, *b))),
                _ => return Err(ParseError::Usage(USAGE)),
            }
        }
        "estop" => {
            let reason = line[head.len()..].trim();
            core(Action::Estop {
                reason: (!reason.is_empty()).then(|| reason.to_string()),
            })
        }
        "clear" => core(Action::ClearEstop),
        "send" => {
            let raw = line[head.len()..].trim();
            let cmd: Command =
                serde_json::from_str(raw).map_err(|e| ParseError::Json(e.to_string()))?;
            ReplCommand::Core(cmd)
        }
        "status" => ReplCommand::Status,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

fn core(action: Action) -> ReplCommand {
    ReplCommand::Core(Command::new(action))
}

fn numbers(args: &[&str]) -> Option<Vec<f64>> {
    args.iter().map(|a| a.parse::<f64>().ok()).collect()
}

/// Read commands from stdin until `quit` or EOF.
pub fn run(dispatcher: &Dispatcher) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("{} ", "rollbot>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        match parse(&line) {
            Ok(None) => {}
            Ok(Some(ReplCommand::Core(cmd))) => report(dispatcher.handle(&cmd)),
            Ok(Some(ReplCommand::Status)) => cmd_status(dispatcher),
            Ok(Some(ReplCommand::Help)) => cmd_help(),
            Ok(Some(ReplCommand::Quit)) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Err(ParseError::Unknown(other)) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "help".bold()
            ),
            Err(e) => println!("{}", e.to_string().yellow()),
        }
    }
}

fn report(result: Result<Ack, RollError>) {
    match result {
        Ok(ack) => {
            let task = ack
                .task_id
                .map(|id| format!(" (task #{id})"))
                .unwrap_or_default();
            match ack.drive {
                Some(d) => println!(
                    "  {} drive speed={} heading={} duration={}ms{}",
                    "✓".green(),
                    d.speed,
                    d.heading,
                    d.duration_ms,
                    task.dimmed()
                ),
                None => println!("  {} {}{}", "✓".green(), ack.command, task.dimmed()),
            }
        }
        Err(RollError::Rejected(v)) => {
            println!("  {} {} ({})", "rejected:".red().bold(), v.constraint, v.value)
        }
        Err(e) => println!("  {} {}", "error:".red().bold(), e),
    }
}

fn cmd_status(dispatcher: &Dispatcher) {
    let t = dispatcher.telemetry();
    let connected = if t.connected {
        "connected".green()
    } else {
        "disconnected".red()
    };
    let estop = if t.estop.latched {
        format!("LATCHED ({})", t.estop.reason).red().bold()
    } else {
        "clear".green()
    };
    println!("  link    : {connected}");
    println!("  estop   : {estop}");
    println!(
        "  battery : {}",
        t.battery_pct
            .map(|p| format!("{p}%"))
            .unwrap_or_else(|| "unknown".into())
    );
    println!(
        "  last cmd: {}",
        t.last_cmd_ts
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".into())
    );
    println!("  in flight: {}", dispatcher.in_flight());
}

fn cmd_help() {
    println!();
    println!("{}", "Rollbot Commands".bold().underline());
    println!("  {}            – connect+wake / sleep+disconnect", "power on|off".bold().cyan());
    println!("  {}  – roll; values are clamped", "drive <s> <h> [ms]".bold().cyan());
    println!("  {}                    – stop rolling", "stop".bold().cyan());
    println!("  {}           – set the main LED", "led <r> <g> <b>".bold().cyan());
    println!("  {}          – latch the emergency stop", "estop [reason]".bold().cyan());
    println!("  {}                   – clear the emergency stop", "clear".bold().cyan());
    println!("  {}              – route a raw JSON command", "send <json>".bold().cyan());
    println!("  {}                  – link, estop and battery", "status".bold().cyan());
    println!("  {}             – exit", "quit  exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(line: &str) -> Action {
        match parse(line) {
            Ok(Some(ReplCommand::Core(cmd))) => cmd.action,
            other => panic!("expected a core command for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn blank_line_is_nothing() {
        assert_eq!(parse("   \n"), Ok(None));
    }

    #[test]
    fn power_requires_on_or_off() {
        assert_eq!(action("power on"), Action::Power { on: true });
        assert_eq!(action("POWER off"), Action::Power { on: false });
        assert_eq!(parse("power maybe"), Err(ParseError::Usage("power on|off")));
    }

    #[test]
    fn drive_with_and_without_duration() {
        assert_eq!(
            action("drive 120 90"),
            Action::Drive {
                speed: 120.0,
                heading: 90.0,
                duration_ms: None
            }
        );
        assert_eq!(
            action("drive 300 -45.5 6000"),
            Action::Drive {
                speed: 300.0,
                heading: -45.5,
                duration_ms: Some(6000.0)
            }
        );
        assert!(matches!(parse("drive fast 10"), Err(ParseError::Usage(_))));
        assert!(matches!(parse("drive 10"), Err(ParseError::Usage(_))));
    }

    #[test]
    fn led_needs_three_bytes() {
        assert_eq!(action("led 255 0 16"), Action::Led(Rgb::new(255, 0, 16)));
        assert!(matches!(parse("led 256 0 0"), Err(ParseError::Usage(_))));
        assert!(matches!(parse("led 1 2"), Err(ParseError::Usage(_))));
    }

    #[test]
    fn estop_keeps_the_whole_reason() {
        assert_eq!(
            action("estop hit the table leg"),
            Action::Estop {
                reason: Some("hit the table leg".into())
            }
        );
        assert_eq!(action("estop"), Action::Estop { reason: None });
    }

    #[test]
    fn send_parses_json_commands() {
        match parse(r#"send {"action":"stop","correlation_id":"x-9"}"#) {
            Ok(Some(ReplCommand::Core(cmd))) => {
                assert_eq!(cmd.action, Action::Stop);
                assert_eq!(cmd.correlation_id.as_deref(), Some("x-9"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse("send {nope"), Err(ParseError::Json(_))));
    }

    #[test]
    fn shell_commands() {
        assert_eq!(action("clear"), Action::ClearEstop);
        assert_eq!(action("stop"), Action::Stop);
        assert_eq!(parse("status"), Ok(Some(ReplCommand::Status)));
        assert_eq!(parse("exit"), Ok(Some(ReplCommand::Quit)));
        assert_eq!(parse("help"), Ok(Some(ReplCommand::Help)));
        assert_eq!(parse("fly"), Err(ParseError::Unknown("fly".into())));
    }
}
