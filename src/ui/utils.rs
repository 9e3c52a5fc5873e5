use corpex::slow::SlowQueryResult;

/// Truncate a string to a maximum number of chars, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// What a result panel shows for its query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelState {
  /// Nothing requested
  Idle,
  /// Fetching, but the group is still within its timeout
  Loading,
  /// Fetching past the group's timeout
  Slow,
  Failed(String),
  /// Data is shown; `stale` when it belongs to the previous request
  Ready { stale: bool },
}

pub fn panel_state<T>(result: &SlowQueryResult<T>) -> PanelState {
  if let Some(error) = &result.error {
    if !result.is_fetching {
      return PanelState::Failed(error.clone());
    }
  }
  if result.data.is_some() {
    return PanelState::Ready {
      stale: result.is_placeholder_data,
    };
  }
  if result.is_slow {
    PanelState::Slow
  } else if result.is_fetching {
    PanelState::Loading
  } else {
    PanelState::Idle
  }
}
