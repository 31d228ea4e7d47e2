//! REPL – the interactive console of the bridge.
//!
//! Lines without a leading `/` are sent to the session through
//! `ExecuteCmd`.  Slash-commands:
//!   /help                          – show this list
//!   /devices                       – list served devices with their state
//!   /read <device> <attr>          – read an attribute
//!   /write <device> <attr> <value> – write an attribute
//!   /cmd <device> <command> [args] – run a device command
//!   /reinit <device>               – re-run a device's init
//!   /watch                         – toggle printing of change events
//!   /quit | /exit                  – gracefully exit the CLI

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tangospec_middleware::LocalServer;
use tangospec_types::{AttrQuality, ChangeEvent, DevState, WireValue};

/// Commands whose whole argument is one free-text string.
const TEXT_COMMANDS: [&str; 6] = [
    "ExecuteCmd",
    "ExecuteCmdA",
    "AddVariable",
    "RemoveVariable",
    "RemoveMotor",
    "RemoveCounter",
];

/// Commands taking `mnemonic [device [alias]]`.
const LIST_COMMANDS: [&str; 2] = ["AddMotor", "AddCounter"];

pub struct Console {
    pub server: Arc<LocalServer>,
    /// The `Spec` device plain lines are sent to.
    pub device: String,
    pub watching: Arc<AtomicBool>,
}

enum Flow {
    Continue,
    Quit,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(console: &Console, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Cannot start line editor".red(), e);
            return;
        }
    };
    let prompt = format!("{} ", "tangospec>".bold().cyan());

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match console.dispatch(line) {
            Flow::Continue => {}
            Flow::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

impl Console {
    fn dispatch(&self, line: &str) -> Flow {
        if !line.starts_with('/') {
            self.call(&self.device, "ExecuteCmd", WireValue::String(line.to_string()));
            return Flow::Continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["/help"] => cmd_help(),
            ["/devices"] => self.cmd_devices(),
            ["/read", device, attr] => match self.server.read_attribute(device, attr) {
                Ok(value) => println!("  {} = {}", attr.bold(), value),
                Err(e) => println!("{}: {}", "Read failed".red(), e),
            },
            ["/write", device, attr, value @ ..] if !value.is_empty() => {
                let value = parse_scalar(&value.join(" "));
                match self.server.write_attribute(device, attr, value) {
                    Ok(()) => println!("  {}", "✓ written".green()),
                    Err(e) => println!("{}: {}", "Write failed".red(), e),
                }
            }
            ["/cmd", device, command, args @ ..] => {
                self.call(device, command, command_arg(command, args));
            }
            ["/reinit", device] => match self.server.reinit(device) {
                Ok(()) => self.print_state(device),
                Err(e) => println!("{}: {}", "Reinit failed".red(), e),
            },
            ["/watch"] => {
                let on = !self.watching.fetch_xor(true, Ordering::SeqCst);
                println!("  Change events {}", if on { "shown".green() } else { "hidden".yellow() });
            }
            ["/quit"] | ["/exit"] => return Flow::Quit,
            _ => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                line.yellow(),
                "/help".bold()
            ),
        }
        Flow::Continue
    }

    fn call(&self, device: &str, command: &str, arg: WireValue) {
        match self.server.command(device, command, arg) {
            Ok(WireValue::Void) => {}
            Ok(WireValue::String(reply)) if reply.is_empty() => {}
            Ok(reply) => println!("{}", reply),
            Err(e) => println!("{}: {}", "Error".red(), e),
        }
    }

    fn cmd_devices(&self) {
        println!("{}", "Devices".bold().underline());
        for name in self.server.device_names() {
            self.print_state(&name);
        }
    }

    fn print_state(&self, device: &str) {
        let state = match self.server.read_attribute(device, "State") {
            Ok(WireValue::State(state)) => state,
            _ => DevState::Unknown,
        };
        let status = self
            .server
            .read_attribute(device, "Status")
            .map(|s| s.to_string())
            .unwrap_or_default();
        let first_line = status.lines().next().unwrap_or_default();
        println!("  {:<28} {:<8} {}", device.bold(), paint(state), first_line.dimmed());
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Console Commands".bold().underline());
    println!("  {}  – run a command in the session", "<text>".bold().cyan());
    println!("  {}  – served devices and their state", "/devices".bold().cyan());
    println!("  {}  – read an attribute", "/read <device> <attr>".bold().cyan());
    println!("  {}  – write an attribute", "/write <device> <attr> <value>".bold().cyan());
    println!("  {}  – run a device command", "/cmd <device> <command> [args]".bold().cyan());
    println!("  {}  – re-run a device's init", "/reinit <device>".bold().cyan());
    println!("  {}  – toggle change event printing", "/watch".bold().cyan());
    println!("  {}  – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn paint(state: DevState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        DevState::On => text.green(),
        DevState::Moving | DevState::Running => text.cyan(),
        s if s.is_alarm_like() => text.red(),
        _ => text.yellow(),
    }
}

/// One change event as a console line.
pub fn format_event(event: &ChangeEvent) -> String {
    let quality = match event.quality {
        AttrQuality::Valid => String::new(),
        other => format!(" ({other:?})"),
    };
    format!(
        "[{}] {}/{} = {}{}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.device,
        event.attribute,
        event.value,
        quality
    )
}

/// Best-effort typing of a console word.
pub fn parse_scalar(text: &str) -> WireValue {
    let text = text.trim();
    if text.is_empty() {
        return WireValue::Void;
    }
    if let Ok(v) = text.parse::<bool>() {
        return WireValue::Boolean(v);
    }
    if let Ok(v) = text.parse::<i64>() {
        return WireValue::Long(v);
    }
    if let Ok(v) = text.parse::<f64>() {
        return WireValue::Double(v);
    }
    WireValue::String(text.to_string())
}

/// Build the argument of `command` from the words typed after it.
pub fn command_arg(command: &str, args: &[&str]) -> WireValue {
    if TEXT_COMMANDS.iter().any(|c| c.eq_ignore_ascii_case(command)) {
        return WireValue::String(args.join(" "));
    }
    if LIST_COMMANDS.iter().any(|c| c.eq_ignore_ascii_case(command)) {
        return WireValue::StringArray(args.iter().map(|s| s.to_string()).collect());
    }
    parse_scalar(&args.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_typed() {
        assert_eq!(parse_scalar(""), WireValue::Void);
        assert_eq!(parse_scalar("true"), WireValue::Boolean(true));
        assert_eq!(parse_scalar("42"), WireValue::Long(42));
        assert_eq!(parse_scalar("-1.5"), WireValue::Double(-1.5));
        assert_eq!(parse_scalar("[1, 2]"), WireValue::String("[1, 2]".into()));
    }

    #[test]
    fn text_commands_keep_the_whole_line() {
        assert_eq!(
            command_arg("ExecuteCmd", &["mv", "th", "1"]),
            WireValue::String("mv th 1".into())
        );
        assert_eq!(
            command_arg("addvariable", &["Energy", "ENERGY", "double"]),
            WireValue::String("Energy ENERGY double".into())
        );
    }

    #[test]
    fn child_commands_take_a_word_list() {
        assert_eq!(
            command_arg("AddMotor", &["th", "id00/fourc/theta"]),
            WireValue::StringArray(vec!["th".into(), "id00/fourc/theta".into()])
        );
    }

    #[test]
    fn other_commands_take_a_scalar() {
        assert_eq!(command_arg("Move", &["5"]), WireValue::Long(5));
        assert_eq!(command_arg("Stop", &[]), WireValue::Void);
        assert_eq!(command_arg("SetEnabled", &["false"]), WireValue::Boolean(false));
    }

    #[test]
    fn events_render_quality_only_when_not_valid() {
        let valid = ChangeEvent::new("a/b/c", "Position", WireValue::Double(1.0), AttrQuality::Valid);
        assert!(format_event(&valid).ends_with("a/b/c/Position = 1"));
        let moving =
            ChangeEvent::new("a/b/c", "Position", WireValue::Double(0.5), AttrQuality::Changing);
        assert!(format_event(&moving).ends_with("= 0.5 (Changing)"));
    }
}
