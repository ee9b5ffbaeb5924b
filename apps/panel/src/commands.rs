//! Line commands typed at the panel prompt, and how the view is printed.

use std::fmt::Write as _;

use anyhow::{bail, Context};
use client_core::MergedView;
use shared::domain::{Field, FieldValue, Mode};

pub const HELP: &str = "commands: power on|off, mode <name>, param <name> <value>, help, quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCommand {
    Intent(Field, FieldValue),
    Help,
    Quit,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> anyhow::Result<Option<PanelCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args = words.collect::<Vec<_>>();
    let command = match (verb, args.as_slice()) {
        ("power", ["on"]) => PanelCommand::Intent(Field::Power, FieldValue::Switch(true)),
        ("power", ["off"]) => PanelCommand::Intent(Field::Power, FieldValue::Switch(false)),
        ("mode", [name]) => PanelCommand::Intent(Field::Mode, FieldValue::Mode(Mode::new(*name))),
        ("param", [name, value]) => {
            let value = value
                .parse::<i64>()
                .with_context(|| format!("parameter value must be an integer, got {value}"))?;
            PanelCommand::Intent(Field::param(*name), FieldValue::Level(value))
        }
        ("help", []) => PanelCommand::Help,
        ("quit" | "exit", []) => PanelCommand::Quit,
        _ => bail!("unrecognized command `{}`; {HELP}", line.trim()),
    };
    Ok(Some(command))
}

/// One-line rendering of the merged view; pending fields carry a `*`.
pub fn render_view(view: &MergedView) -> String {
    let mark = |field: &Field| if view.is_pending(field) { "*" } else { "" };
    let mut line = format!(
        "power={}{} mode={}{}",
        if view.state.power { "on" } else { "off" },
        mark(&Field::Power),
        view.state.mode,
        mark(&Field::Mode),
    );
    for (name, value) in &view.state.parameters {
        let _ = write!(line, " {name}={value}{}", mark(&Field::Param(name.clone())));
    }
    if !view.synced {
        line.push_str(" (not synced)");
    }
    line
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
