//! Console Commands
//!
//! Name → handler table for operator input. Names are matched
//! case-insensitively and must be unique.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::handle::ServerHandle;
use crate::network::session::SessionId;

/// Command registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// A command with this name is already registered.
    #[error("command '{0}' is already registered")]
    Conflict(String),
}

/// Handler run with the remaining whitespace-separated tokens.
pub type Executor<C> = fn(&mut C, &[&str]);

/// One console command.
pub struct Command<C> {
    name: String,
    description: String,
    args: String,
    executor: Executor<C>,
}

impl<C> Command<C> {
    /// Create a command; the name is stored lower-cased.
    pub fn new(
        name: impl AsRef<str>,
        description: impl Into<String>,
        args: impl Into<String>,
        executor: Executor<C>,
    ) -> Self {
        Self {
            name: name.as_ref().to_lowercase(),
            description: description.into(),
            args: args.into(),
            executor,
        }
    }

    /// Lower-cased name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the handler.
    pub fn run(&self, context: &mut C, args: &[&str]) {
        (self.executor)(context, args);
    }
}

impl<C> fmt::Display for Command<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{} - {}", self.name, self.description)
        } else {
            write!(f, "{} {} - {}", self.name, self.args, self.description)
        }
    }
}

/// Registered commands, sorted by name.
pub struct CommandList<C> {
    commands: BTreeMap<String, Command<C>>,
}

impl<C> Default for CommandList<C> {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }
}

impl<C> CommandList<C> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Fails if the name is taken.
    pub fn register(&mut self, command: Command<C>) -> Result<(), CommandError> {
        if self.commands.contains_key(command.name()) {
            return Err(CommandError::Conflict(command.name));
        }
        self.commands.insert(command.name.clone(), command);
        Ok(())
    }

    /// Look up a command by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&Command<C>> {
        self.commands.get(&name.to_lowercase())
    }

    /// Registered commands in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Command<C>> {
        self.commands.values()
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Is the registry empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run one input line. Returns `false` for empty input or an unknown
    /// command name.
    pub fn execute(&self, context: &mut C, line: &str) -> bool {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            return false;
        };
        let Some(command) = self.get(name) else {
            return false;
        };
        let args: Vec<&str> = tokens.collect();
        command.run(context, &args);
        true
    }

    /// `help` output, one line per command.
    pub fn help_lines(&self) -> Vec<String> {
        self.iter().map(ToString::to_string).collect()
    }
}

// =============================================================================
// OPERATOR COMMANDS
// =============================================================================

/// Registry with every built-in operator command.
pub fn builtin_commands() -> Result<CommandList<ServerHandle>, CommandError> {
    let mut commands = CommandList::new();
    commands.register(Command::new("help", "list available commands", "", help))?;
    commands.register(Command::new("stop", "close the listener and exit", "", stop))?;
    commands.register(Command::new(
        "connections",
        "show connected and queued sessions",
        "",
        connections,
    ))?;
    commands.register(Command::new("routers", "show playing routers", "", routers))?;
    commands.register(Command::new("say", "send a server notice", "<text...>", say))?;
    commands.register(Command::new("kick", "close a session", "<id>", kick))?;
    Ok(commands)
}

fn help(handle: &mut ServerHandle, _args: &[&str]) {
    handle.logger.print("available commands:");
    for line in handle.help() {
        handle.logger.print(format!("  {line}"));
    }
}

fn stop(handle: &mut ServerHandle, _args: &[&str]) {
    handle.logger.print("stopping");
    handle.stop();
}

fn connections(handle: &mut ServerHandle, _args: &[&str]) {
    let listener = &handle.listener;
    handle.logger.print(format!(
        "{} connected, {} queued",
        listener.session_count(),
        listener.queued_count()
    ));
    for session in listener.sessions() {
        let state = if session.router().is_some() {
            "playing"
        } else {
            "waiting"
        };
        handle
            .logger
            .print(format!("  {} {} {}", session.id(), session.remote_address(), state));
    }
}

fn routers(handle: &mut ServerHandle, _args: &[&str]) {
    handle
        .logger
        .print(format!("{} playing routers", handle.listener.router_count()));
}

fn say(handle: &mut ServerHandle, args: &[&str]) {
    if args.is_empty() {
        handle.logger.print("usage: say <text...>");
        return;
    }
    let reached = handle.listener.announce(&args.join(" "));
    handle.logger.print(format!("notice sent to {reached} sessions"));
}

fn kick(handle: &mut ServerHandle, args: &[&str]) {
    let Some(raw) = args.first() else {
        handle.logger.print("usage: kick <id>");
        return;
    };
    let Ok(id) = raw.trim_start_matches('#').parse::<u64>() else {
        handle.logger.print(format!("'{raw}' is not a session id"));
        return;
    };
    let id = SessionId::new(id);
    if handle.listener.kick(id, "Kicked by operator") {
        handle.logger.print(format!("kicked {id}"));
    } else {
        handle.logger.print(format!("no open session {id}"));
    }
}
