pub mod components;
mod header;
mod panels;
mod utils;

use crate::app::{App, Mode};
use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// Main draw function
pub fn draw(frame: &mut Frame, app: &mut App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(1), // Header
      Constraint::Min(1),    // Main content
      Constraint::Length(1), // Status bar
    ])
    .split(frame.area());

  header::draw_header(
    frame,
    chunks[0],
    app.selected().len(),
    app.corpora().len(),
    app.slow_timeout(),
  );

  let columns = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
    .split(chunks[1]);

  panels::draw_corpora(frame, columns[0], app);

  let right = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(3), // Query
      Constraint::Min(3),    // Nodes
      Constraint::Length(3), // Count
    ])
    .split(columns[1]);

  panels::draw_query(frame, right[0], app);
  let nodes = app.nodes_result();
  panels::draw_nodes(frame, right[1], &nodes);
  let matches = app.matches_result();
  panels::draw_count(frame, right[2], &matches, !app.selected().is_empty());

  draw_status_bar(frame, chunks[2], app);

  app.command_input().render_overlay(frame, chunks[1]);
}

fn draw_status_bar(frame: &mut Frame, area: Rect, app: &App) {
  let (content, style) = match (app.mode(), app.message()) {
    (Mode::Normal, Some(message)) => (format!(" {}", message), Style::default().fg(Color::Red)),
    (Mode::Normal, None) => (
      " :command  /query  j/k:nav  space:select  r:refetch  q:quit".to_string(),
      Style::default().fg(Color::DarkGray),
    ),
    (Mode::Command, _) => (
      " Tab:next  Enter:run  Esc:cancel".to_string(),
      Style::default().fg(Color::Yellow),
    ),
    (Mode::Query, _) => (
      " Enter:submit  Up/Down:history  Esc:cancel".to_string(),
      Style::default().fg(Color::Cyan),
    ),
  };

  frame.render_widget(Paragraph::new(content).style(style), area);
}
