use ratatui::prelude::*;
use ratatui::widgets::Paragraph;
use std::time::Duration;

/// Draw the header bar with logo, selection summary, and shortcuts
pub fn draw_header(frame: &mut Frame, area: Rect, selected: usize, total: usize, timeout: Duration) {
  let header = Line::from(vec![
    Span::styled(" corpex ", Style::default().fg(Color::Cyan).bold()),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(
      format!(" {} ", selection_label(selected, total)),
      Style::default().fg(Color::Yellow).bold(),
    ),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(
      format!(" slow after {}ms ", timeout.as_millis()),
      Style::default().fg(Color::White),
    ),
    Span::raw("  "),
    // Shortcuts - keys and brackets highlighted, descriptions dimmed
    Span::styled("<:>", Style::default().fg(Color::Cyan)),
    Span::styled(" command", Style::default().fg(Color::DarkGray)),
    Span::raw("   "),
    Span::styled("</>", Style::default().fg(Color::Cyan)),
    Span::styled(" query", Style::default().fg(Color::DarkGray)),
    Span::raw("   "),
    Span::styled("<space>", Style::default().fg(Color::Cyan)),
    Span::styled(" select", Style::default().fg(Color::DarkGray)),
    Span::raw("   "),
    Span::styled("<r>", Style::default().fg(Color::Cyan)),
    Span::styled(" refetch", Style::default().fg(Color::DarkGray)),
    Span::raw("   "),
    Span::styled("<q>", Style::default().fg(Color::Cyan)),
    Span::styled(" quit", Style::default().fg(Color::DarkGray)),
  ]);

  let paragraph = Paragraph::new(header).style(Style::default().bg(Color::Black));

  frame.render_widget(paragraph, area);
}

fn selection_label(selected: usize, total: usize) -> String {
  match selected {
    0 => "no corpus selected".to_string(),
    n if n == total && n > 1 => format!("all {} corpora", total),
    1 => format!("1 of {} corpora", total),
    n => format!("{} of {} corpora", n, total),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_selection_label() {
    assert_eq!(selection_label(0, 4), "no corpus selected");
    assert_eq!(selection_label(1, 4), "1 of 4 corpora");
    assert_eq!(selection_label(3, 4), "3 of 4 corpora");
    assert_eq!(selection_label(4, 4), "all 4 corpora");
  }
}
