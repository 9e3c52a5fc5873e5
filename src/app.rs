use crate::commands::CommandKind;
use crate::event::{Event, EventHandler};
use crate::ui;
use crate::ui::components::{CommandEvent, CommandInput, InputResult, KeyResult, TextInput};
use color_eyre::Result;
use corpex::backend::{CorpusBackend, QueryNode};
use corpex::config::Config;
use corpex::query::QueryKey;
use corpex::query_key;
use corpex::slow::{SlowQuery, SlowQueryOptions, SlowQueryResult};
use corpex::QueryClient;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use futures::future::BoxFuture;
use futures::FutureExt;
use ratatui::prelude::*;
use ratatui::widgets::ListState;
use std::collections::BTreeSet;
use std::io::stdout;
use std::time::Duration;
use tracing::{debug, info};

const TICK_RATE: Duration = Duration::from_millis(100);

/// Input mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Normal,
  Command,
  Query,
}

/// Main application state
pub struct App {
  config: Config,
  backend: CorpusBackend,
  client: QueryClient,

  corpora: Vec<String>,
  selected: BTreeSet<String>,
  list_state: ListState,

  mode: Mode,
  query_input: TextInput,
  command_input: CommandInput,

  /// Last submitted query text
  query: String,
  nodes: SlowQuery<Vec<QueryNode>>,
  matches: SlowQuery<u64>,

  /// One-line status message, replaced by the next one
  message: Option<String>,
  should_quit: bool,
  /// Whether the screen needs to be redrawn
  dirty: bool,
}

impl App {
  /// Must be called inside the tokio runtime; queries fetch on spawned tasks.
  pub fn new(config: Config) -> Result<Self> {
    let backend = CorpusBackend::new(&config.backend);
    let client = QueryClient::with_slow_tracking();
    let corpora = backend.list_corpora();
    let selected = BTreeSet::new();
    let query = String::new();

    let nodes = SlowQuery::new(
      &client,
      nodes_key(&query),
      nodes_fetcher(backend.clone(), query.clone()),
      nodes_options(&config),
    )?;
    let matches = SlowQuery::new(
      &client,
      matches_key(&query, &selected),
      matches_fetcher(backend.clone(), query.clone(), &selected),
      matches_options(&config),
    )?;

    let mut list_state = ListState::default();
    if !corpora.is_empty() {
      list_state.select(Some(0));
    }

    Ok(Self {
      config,
      backend,
      client,
      corpora,
      selected,
      list_state,
      mode: Mode::Normal,
      query_input: TextInput::new(),
      command_input: CommandInput::new(),
      query,
      nodes,
      matches,
      message: None,
      should_quit: false,
      dirty: true,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = self.event_loop(&mut terminal).await;

    // Restore the terminal even when the loop failed
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
  }

  async fn event_loop<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
    let mut events = EventHandler::new(TICK_RATE);

    while !self.should_quit {
      if self.dirty {
        terminal.draw(|frame| ui::draw(frame, self))?;
        self.dirty = false;
      }

      match events.next().await {
        Some(event) => self.handle_event(event)?,
        None => break,
      }
    }

    Ok(())
  }

  fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Key(key) => {
        self.handle_key(key)?;
        self.dirty = true;
      }
      Event::Resize => self.dirty = true,
      Event::Tick => {
        // Poll both, a short-circuit would leave one change unreported
        let changed = self.nodes.poll() | self.matches.poll();
        if changed {
          self.dirty = true;
        }
      }
    }
    Ok(())
  }

  fn handle_key(&mut self, key: KeyEvent) -> Result<()> {
    match self.mode {
      Mode::Normal => self.handle_normal_mode_key(key),
      Mode::Command => self.handle_command_mode_key(key),
      Mode::Query => self.handle_query_mode_key(key),
    }
  }

  fn handle_normal_mode_key(&mut self, key: KeyEvent) -> Result<()> {
    match key.code {
      KeyCode::Char('q') => self.should_quit = true,
      KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
        self.should_quit = true;
      }

      KeyCode::Up | KeyCode::Char('k') => self.move_selection(-1),
      KeyCode::Down | KeyCode::Char('j') => self.move_selection(1),
      KeyCode::Char(' ') | KeyCode::Enter => self.toggle_current()?,

      KeyCode::Char('/') | KeyCode::Char('e') => {
        self.mode = Mode::Query;
        self.query_input.set_value(&self.query);
      }
      KeyCode::Char(':') => {
        self.command_input.activate();
        self.mode = Mode::Command;
      }
      KeyCode::Char('r') => self.refetch(),

      _ => {}
    }
    Ok(())
  }

  fn handle_command_mode_key(&mut self, key: KeyEvent) -> Result<()> {
    let result = self.command_input.handle_key(key);
    if !self.command_input.is_active() {
      self.mode = Mode::Normal;
    }
    if let KeyResult::Event(event) = result {
      match event {
        CommandEvent::Run(kind) => self.execute_command(kind)?,
        CommandEvent::Unknown(typed) => {
          self.message = Some(format!("Unknown command: {}", typed));
        }
        CommandEvent::Cancelled => {}
      }
    }
    Ok(())
  }

  fn handle_query_mode_key(&mut self, key: KeyEvent) -> Result<()> {
    match self.query_input.handle_key(key) {
      InputResult::Submitted(value) => {
        self.mode = Mode::Normal;
        self.set_query(value.trim())?;
      }
      InputResult::Cancelled => self.mode = Mode::Normal,
      InputResult::Consumed | InputResult::NotHandled => {}
    }
    Ok(())
  }

  fn execute_command(&mut self, kind: CommandKind) -> Result<()> {
    debug!(command = ?kind, "Executing command");
    match kind {
      CommandKind::SelectAll => {
        self.selected = self.corpora.iter().cloned().collect();
        self.refresh_queries()?;
      }
      CommandKind::ClearSelection => {
        self.selected.clear();
        self.refresh_queries()?;
      }
      CommandKind::Refetch => self.refetch(),
      CommandKind::Quit => self.should_quit = true,
    }
    Ok(())
  }

  fn set_query(&mut self, query: &str) -> Result<()> {
    if query == self.query {
      return Ok(());
    }
    info!(query, "Query changed");
    self.query = query.to_string();
    self.message = None;
    self.refresh_queries()
  }

  fn toggle_current(&mut self) -> Result<()> {
    let Some(corpus) = self
      .list_state
      .selected()
      .and_then(|i| self.corpora.get(i))
      .cloned()
    else {
      return Ok(());
    };

    if !self.selected.remove(&corpus) {
      self.selected.insert(corpus);
    }
    self.refresh_queries()
  }

  fn move_selection(&mut self, delta: i32) {
    if self.corpora.is_empty() {
      return;
    }
    let len = self.corpora.len() as i32;
    let current = self.list_state.selected().unwrap_or(0) as i32;
    let next = (current + delta).clamp(0, len - 1);
    self.list_state.select(Some(next as usize));
  }

  /// Re-declare both queries for the current query text and selection,
  /// and start fetching whatever is missing.
  fn refresh_queries(&mut self) -> Result<()> {
    self.nodes.update(
      &self.client,
      nodes_key(&self.query),
      nodes_fetcher(self.backend.clone(), self.query.clone()),
      nodes_options(&self.config),
    )?;
    self.matches.update(
      &self.client,
      matches_key(&self.query, &self.selected),
      matches_fetcher(self.backend.clone(), self.query.clone(), &self.selected),
      matches_options(&self.config),
    )?;

    if self.has_query() {
      self.nodes.ensure_data();
      if !self.selected.is_empty() {
        self.matches.ensure_data();
      }
    }
    Ok(())
  }

  fn refetch(&mut self) {
    if !self.has_query() {
      self.message = Some("Nothing to refetch, enter a query with /".to_string());
      return;
    }
    self.nodes.refetch();
    if !self.selected.is_empty() {
      self.matches.refetch();
    }
  }

  pub fn has_query(&self) -> bool {
    !self.query.is_empty()
  }

  pub fn mode(&self) -> Mode {
    self.mode
  }

  pub fn query(&self) -> &str {
    &self.query
  }

  pub fn query_input(&self) -> &TextInput {
    &self.query_input
  }

  pub fn command_input(&self) -> &CommandInput {
    &self.command_input
  }

  pub fn corpora(&self) -> &[String] {
    &self.corpora
  }

  pub fn selected(&self) -> &BTreeSet<String> {
    &self.selected
  }

  pub fn list_state_mut(&mut self) -> &mut ListState {
    &mut self.list_state
  }

  pub fn message(&self) -> Option<&str> {
    self.message.as_deref()
  }

  pub fn slow_timeout(&self) -> Duration {
    self.config.slow_query.timeout()
  }

  pub fn nodes_result(&mut self) -> SlowQueryResult<Vec<QueryNode>> {
    self.nodes.result()
  }

  pub fn matches_result(&mut self) -> SlowQueryResult<u64> {
    self.matches.result()
  }
}

fn nodes_key(query: &str) -> QueryKey {
  query_key!["query-nodes", query]
}

/// Selection order does not matter: the set iterates sorted.
fn matches_key(query: &str, corpora: &BTreeSet<String>) -> QueryKey {
  corpora
    .iter()
    .fold(query_key!["match-count", query], |key, corpus| {
      key.with(corpus.as_str())
    })
}

fn nodes_options(config: &Config) -> SlowQueryOptions {
  SlowQueryOptions::new(query_key!["query-nodes"], config.slow_query.timeout())
}

fn matches_options(config: &Config) -> SlowQueryOptions {
  SlowQueryOptions::new(query_key!["match-count"], config.slow_query.timeout())
}

fn nodes_fetcher(
  backend: CorpusBackend,
  query: String,
) -> impl Fn() -> BoxFuture<'static, Result<Vec<QueryNode>, String>> + Send + Sync + 'static {
  move || {
    let backend = backend.clone();
    let query = query.clone();
    async move { backend.query_nodes(&query).await.map_err(|e| e.to_string()) }.boxed()
  }
}

fn matches_fetcher(
  backend: CorpusBackend,
  query: String,
  corpora: &BTreeSet<String>,
) -> impl Fn() -> BoxFuture<'static, Result<u64, String>> + Send + Sync + 'static {
  let corpora: Vec<String> = corpora.iter().cloned().collect();
  move || {
    let backend = backend.clone();
    let query = query.clone();
    let corpora = corpora.clone();
    async move {
      backend
        .count_matches(&corpora, &query)
        .await
        .map_err(|e| e.to_string())
    }
    .boxed()
  }
}
