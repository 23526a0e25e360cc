//! Closed command set decoded from each protocol line.

/// Broad behavioural class of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Reads state of the paused frame; never resumes the unit.
    Inspection,
    /// Resumes the unit until its next stop.
    Stepping,
    /// Ends the session and releases the unit.
    Continuation,
    /// Follows the unit's next nested call.
    Descend,
    /// Awaits the result of the unit's last nested call.
    Materialize,
    /// Handled by the bridge itself.
    Meta,
}

/// One debugger command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Source around the current line.
    List,
    /// Whole source of the current function.
    LongList,
    /// Call chain of the paused unit.
    Where,
    /// Arguments of the current function.
    Args,
    /// Evaluate a name in the current frame.
    Print(String),
    /// Run to the next line in the current function.
    Next,
    /// Run to the very next line, entering scopes.
    Step,
    /// Run until the current scope returns.
    Return,
    /// Resume normal execution.
    Continue,
    /// End debugging and resume normal execution.
    Quit,
    /// Follow the unit's next nested call into its own session.
    Descend,
    /// Materialize the result of the last nested call.
    Get,
    /// Command summary.
    Help,
    /// Empty line: repeat the previous command.
    Repeat,
    /// Anything else.
    Unrecognized(String),
}

impl Command {
    /// Decode one protocol line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "" => Self::Repeat,
            "l" | "list" => Self::List,
            "ll" | "longlist" => Self::LongList,
            "w" | "where" | "bt" => Self::Where,
            "a" | "args" => Self::Args,
            "p" | "print" if !rest.is_empty() => Self::Print(rest.to_owned()),
            "n" | "next" => Self::Next,
            "s" | "step" => Self::Step,
            "r" | "return" => Self::Return,
            "c" | "cont" | "continue" => Self::Continue,
            "q" | "quit" | "exit" => Self::Quit,
            "remote" | "descend" => Self::Descend,
            "get" => Self::Get,
            "h" | "help" | "?" => Self::Help,
            other => Self::Unrecognized(other.to_owned()),
        }
    }

    /// Behavioural class of this command.
    #[must_use]
    pub fn class(&self) -> CommandClass {
        match self {
            Self::List | Self::LongList | Self::Where | Self::Args | Self::Print(_) => {
                CommandClass::Inspection
            }
            Self::Next | Self::Step | Self::Return => CommandClass::Stepping,
            Self::Continue | Self::Quit => CommandClass::Continuation,
            Self::Descend => CommandClass::Descend,
            Self::Get => CommandClass::Materialize,
            Self::Help | Self::Repeat | Self::Unrecognized(_) => CommandClass::Meta,
        }
    }
}

/// Text returned for `help`.
pub const HELP_TEXT: &str = "\
Documented commands:
  l(ist)          source around the current line
  ll | longlist   whole source of the current function
  w(here) | bt    call chain
  a(rgs)          arguments of the current function
  p <name>        print a local variable
  n(ext)          run to the next line in this function
  s(tep)          run to the very next line
  r(eturn)        run until the current function returns
  c(ont(inue))    resume execution and end the session
  q(uit)          end the session and resume execution
  remote          follow the next nested call into its own session
  get             wait for and print the result of the last nested call
";
