use super::utils::{panel_state, truncate, PanelState};
use crate::app::{App, Mode};
use corpex::backend::QueryNode;
use corpex::slow::SlowQueryResult;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};

/// Corpus list with selection checkboxes
pub fn draw_corpora(frame: &mut Frame, area: Rect, app: &mut App) {
  let items: Vec<ListItem> = app
    .corpora()
    .iter()
    .map(|corpus| {
      let (mark, style) = if app.selected().contains(corpus) {
        ("[x] ", Style::default().fg(Color::Green))
      } else {
        ("[ ] ", Style::default().fg(Color::White))
      };
      let width = area.width.saturating_sub(6) as usize;
      ListItem::new(Line::from(vec![
        Span::styled(mark, style),
        Span::styled(truncate(corpus, width), style),
      ]))
    })
    .collect();

  let block = Block::default()
    .borders(Borders::ALL)
    .border_style(Style::default().fg(Color::DarkGray))
    .title(" Corpora ");

  let list = List::new(items)
    .block(block)
    .highlight_style(Style::default().bg(Color::DarkGray).fg(Color::White));

  frame.render_stateful_widget(list, area, app.list_state_mut());
}

/// Query text box; shows the editor while in query mode
pub fn draw_query(frame: &mut Frame, area: Rect, app: &App) {
  let editing = app.mode() == Mode::Query;
  let border = if editing { Color::Cyan } else { Color::DarkGray };
  let block = Block::default()
    .borders(Borders::ALL)
    .border_style(Style::default().fg(border))
    .title(" Query ");

  let line = if editing {
    let input = app.query_input();
    let value: Vec<char> = input.value().chars().collect();
    let (before, after) = value.split_at(input.cursor_position().min(value.len()));
    Line::from(vec![
      Span::raw(before.iter().collect::<String>()),
      Span::styled("_", Style::default().fg(Color::Cyan)),
      Span::raw(after.iter().collect::<String>()),
    ])
  } else if app.has_query() {
    Line::from(app.query().to_string())
  } else {
    Line::styled(
      "press / to enter a query",
      Style::default().fg(Color::DarkGray),
    )
  };

  frame.render_widget(Paragraph::new(line).block(block), area);
}

pub fn draw_nodes(frame: &mut Frame, area: Rect, result: &SlowQueryResult<Vec<QueryNode>>) {
  let block = panel_block(" Nodes ");

  let lines: Vec<Line> = match panel_state(result) {
    PanelState::Ready { stale } => {
      let style = data_style(stale);
      result
        .data
        .iter()
        .flat_map(|nodes| nodes.iter())
        .map(|node| {
          Line::from(vec![
            Span::styled(format!("{:<4}", node.variable), Style::default().fg(Color::Cyan)),
            Span::styled(node.expression.clone(), style),
          ])
        })
        .collect()
    }
    state => vec![state_line(&state)],
  };

  frame.render_widget(Paragraph::new(lines).block(block), area);
}

pub fn draw_count(
  frame: &mut Frame,
  area: Rect,
  result: &SlowQueryResult<u64>,
  has_selection: bool,
) {
  let block = panel_block(" Matches ");

  let line = match panel_state(result) {
    PanelState::Ready { stale } => Line::from(vec![
      Span::styled(
        result.data.as_deref().copied().unwrap_or_default().to_string(),
        data_style(stale).bold(),
      ),
      Span::styled(" matches", Style::default().fg(Color::DarkGray)),
    ]),
    PanelState::Idle if !has_selection => Line::styled(
      "select corpora to count matches",
      Style::default().fg(Color::DarkGray),
    ),
    state => state_line(&state),
  };

  frame.render_widget(Paragraph::new(line).block(block), area);
}

fn panel_block(title: &str) -> Block<'_> {
  Block::default()
    .borders(Borders::ALL)
    .border_style(Style::default().fg(Color::DarkGray))
    .title(title)
}

/// Placeholder data from the previous request is dimmed
fn data_style(stale: bool) -> Style {
  if stale {
    Style::default().fg(Color::DarkGray)
  } else {
    Style::default().fg(Color::White)
  }
}

fn state_line(state: &PanelState) -> Line<'static> {
  match state {
    // Fast requests finish before anything is shown
    PanelState::Idle | PanelState::Loading | PanelState::Ready { .. } => Line::raw(""),
    PanelState::Slow => Line::styled("still working...", Style::default().fg(Color::Yellow)),
    PanelState::Failed(error) => Line::styled(error.clone(), Style::default().fg(Color::Red)),
  }
}
