use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Result of handling a key event in an input component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputResult {
  /// Key was handled, continue input mode
  Consumed,
  /// Enter pressed, here's the submitted value
  Submitted(String),
  /// Escape pressed, input cancelled
  Cancelled,
  /// Key not handled, pass to next handler
  NotHandled,
}

/// Single-line text input with a history of submitted values.
///
/// Cursor positions are char indices, so multi-byte query text (umlauts in
/// annotation values are common) edits correctly.
#[derive(Debug, Clone, Default)]
pub struct TextInput {
  chars: Vec<char>,
  cursor: usize,
  history: Vec<String>,
  /// Position while browsing history; None when editing fresh text
  history_pos: Option<usize>,
}

impl TextInput {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn value(&self) -> String {
    self.chars.iter().collect()
  }

  /// Replace the content and move the cursor to the end
  pub fn set_value(&mut self, value: &str) {
    self.chars = value.chars().collect();
    self.cursor = self.chars.len();
  }

  pub fn clear(&mut self) {
    self.chars.clear();
    self.cursor = 0;
    self.history_pos = None;
  }

  /// Cursor position in chars, for rendering
  pub fn cursor_position(&self) -> usize {
    self.cursor
  }

  pub fn handle_key(&mut self, key: KeyEvent) -> InputResult {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
      KeyCode::Esc => {
        self.history_pos = None;
        InputResult::Cancelled
      }
      KeyCode::Enter => {
        let value = self.value();
        self.remember(&value);
        InputResult::Submitted(value)
      }
      KeyCode::Up => {
        self.history_back();
        InputResult::Consumed
      }
      KeyCode::Down => {
        self.history_forward();
        InputResult::Consumed
      }
      KeyCode::Backspace => {
        if self.cursor > 0 {
          self.cursor -= 1;
          self.chars.remove(self.cursor);
        }
        InputResult::Consumed
      }
      KeyCode::Delete => {
        if self.cursor < self.chars.len() {
          self.chars.remove(self.cursor);
        }
        InputResult::Consumed
      }
      KeyCode::Left => {
        self.cursor = self.cursor.saturating_sub(1);
        InputResult::Consumed
      }
      KeyCode::Right => {
        self.cursor = (self.cursor + 1).min(self.chars.len());
        InputResult::Consumed
      }
      KeyCode::Home => {
        self.cursor = 0;
        InputResult::Consumed
      }
      KeyCode::End => {
        self.cursor = self.chars.len();
        InputResult::Consumed
      }
      KeyCode::Char('a') if ctrl => {
        self.cursor = 0;
        InputResult::Consumed
      }
      KeyCode::Char('e') if ctrl => {
        self.cursor = self.chars.len();
        InputResult::Consumed
      }
      KeyCode::Char('u') if ctrl => {
        // Clear line before cursor
        self.chars.drain(..self.cursor);
        self.cursor = 0;
        InputResult::Consumed
      }
      KeyCode::Char(c) if !ctrl => {
        self.chars.insert(self.cursor, c);
        self.cursor += 1;
        InputResult::Consumed
      }
      _ => InputResult::NotHandled,
    }
  }

  fn remember(&mut self, value: &str) {
    self.history_pos = None;
    if value.trim().is_empty() || self.history.last().map(String::as_str) == Some(value) {
      return;
    }
    self.history.push(value.to_string());
  }

  fn history_back(&mut self) {
    if self.history.is_empty() {
      return;
    }
    let pos = match self.history_pos {
      Some(pos) => pos.saturating_sub(1),
      None => self.history.len() - 1,
    };
    self.history_pos = Some(pos);
    let value = self.history[pos].clone();
    self.set_value(&value);
  }

  fn history_forward(&mut self) {
    let Some(pos) = self.history_pos else {
      return;
    };
    if pos + 1 < self.history.len() {
      self.history_pos = Some(pos + 1);
      let value = self.history[pos + 1].clone();
      self.set_value(&value);
    } else {
      self.history_pos = None;
      self.set_value("");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(code: KeyCode) -> KeyEvent {
    KeyEvent::new(code, KeyModifiers::NONE)
  }

  fn ctrl_key(code: KeyCode) -> KeyEvent {
    KeyEvent::new(code, KeyModifiers::CONTROL)
  }

  fn type_str(input: &mut TextInput, s: &str) {
    for c in s.chars() {
      input.handle_key(key(KeyCode::Char(c)));
    }
  }

  #[test]
  fn test_submit() {
    let mut input = TextInput::new();
    type_str(&mut input, "tok");
    assert_eq!(
      input.handle_key(key(KeyCode::Enter)),
      InputResult::Submitted("tok".to_string())
    );
  }

  #[test]
  fn test_multibyte_editing() {
    let mut input = TextInput::new();
    type_str(&mut input, "tok=\"Hus\"");
    input.handle_key(key(KeyCode::Left));
    input.handle_key(key(KeyCode::Left));
    input.handle_key(key(KeyCode::Backspace));
    input.handle_key(key(KeyCode::Char('ä')));
    assert_eq!(input.value(), "tok=\"Häs\"");
    assert_eq!(input.cursor_position(), 7);
  }

  #[test]
  fn test_ctrl_u_clear_before_cursor() {
    let mut input = TextInput::new();
    type_str(&mut input, "pos=\"NN\" & tok");
    for _ in 0..3 {
      input.handle_key(key(KeyCode::Left));
    }
    input.handle_key(ctrl_key(KeyCode::Char('u')));
    assert_eq!(input.value(), "tok");
    assert_eq!(input.cursor_position(), 0);
  }

  #[test]
  fn test_history_navigation() {
    let mut input = TextInput::new();
    for q in ["tok", "pos=\"NN\""] {
      input.set_value(q);
      input.handle_key(key(KeyCode::Enter));
    }
    input.clear();

    input.handle_key(key(KeyCode::Up));
    assert_eq!(input.value(), "pos=\"NN\"");
    input.handle_key(key(KeyCode::Up));
    assert_eq!(input.value(), "tok");
    input.handle_key(key(KeyCode::Up));
    assert_eq!(input.value(), "tok");
    input.handle_key(key(KeyCode::Down));
    assert_eq!(input.value(), "pos=\"NN\"");
    input.handle_key(key(KeyCode::Down));
    assert!(input.value().is_empty());
  }

  #[test]
  fn test_blank_and_repeated_submissions_not_remembered() {
    let mut input = TextInput::new();
    input.handle_key(key(KeyCode::Enter));
    input.set_value("tok");
    input.handle_key(key(KeyCode::Enter));
    input.handle_key(key(KeyCode::Enter));
    assert_eq!(input.history.len(), 1);
  }
}
