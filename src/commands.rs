/// Available commands and autocomplete logic

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
  SelectAll,
  ClearSelection,
  Refetch,
  Quit,
}

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
  pub kind: CommandKind,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "select-all",
    aliases: &["a", "all"],
    description: "Select every corpus",
    kind: CommandKind::SelectAll,
  },
  Command {
    name: "clear",
    aliases: &["c", "none"],
    description: "Deselect all corpora",
    kind: CommandKind::ClearSelection,
  },
  Command {
    name: "refetch",
    aliases: &["r", "reload"],
    description: "Run the current query again",
    kind: CommandKind::Refetch,
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    description: "Exit corpex",
    kind: CommandKind::Quit,
  },
];

/// Get autocomplete suggestions for a given input
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.trim().to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = COMMANDS
    .iter()
    .filter_map(|cmd| match_priority(cmd, &input_lower).map(|p| (cmd, p)))
    .collect();

  matches.sort_by_key(|(_, priority)| *priority);
  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Lower is better; None if the command does not match at all.
fn match_priority(cmd: &Command, input: &str) -> Option<u32> {
  if cmd.name == input {
    Some(0)
  } else if cmd.aliases.contains(&input) {
    Some(1)
  } else if cmd.name.starts_with(input) {
    Some(2)
  } else if cmd.aliases.iter().any(|a| a.starts_with(input)) {
    Some(3)
  } else if cmd.name.contains(input) {
    Some(4)
  } else if cmd.aliases.iter().any(|a| a.contains(input)) {
    Some(5)
  } else {
    None
  }
}

/// Resolve typed input to a command: the selected suggestion if any.
pub fn resolve(input: &str, selected: usize) -> Option<CommandKind> {
  get_suggestions(input).get(selected).map(|cmd| cmd.kind)
}
