//! Simulated corpus query backend.
//!
//! Stands in for the native query engine: the real one parses queries and
//! counts matches in stored corpora, this one answers after a configurable
//! delay so the UI's loading and slow states can be exercised.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::BackendConfig;

/// One node of a corpus query, e.g. `#1` for `tok="house"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryNode {
  pub variable: String,
  pub expression: String,
}

/// Corpus backend client
#[derive(Debug, Clone)]
pub struct CorpusBackend {
  corpora: Arc<Vec<String>>,
  count_latency: Duration,
  node_latency: Duration,
}

impl CorpusBackend {
  pub fn new(config: &BackendConfig) -> Self {
    Self {
      corpora: Arc::new(config.corpora.clone()),
      count_latency: config.count_latency(),
      node_latency: config.node_latency(),
    }
  }

  /// Names of all available corpora
  pub fn list_corpora(&self) -> Vec<String> {
    self.corpora.as_ref().clone()
  }

  /// Extract the nodes of a query
  pub async fn query_nodes(&self, query: &str) -> Result<Vec<QueryNode>> {
    tokio::time::sleep(self.node_latency).await;
    parse_nodes(query)
  }

  /// Count the matches of a query in the given corpora
  pub async fn count_matches(&self, corpora: &[String], query: &str) -> Result<u64> {
    tokio::time::sleep(self.count_latency).await;

    if corpora.is_empty() {
      return Err(eyre!("No corpus selected"));
    }
    if let Some(unknown) = corpora.iter().find(|c| !self.corpora.contains(*c)) {
      return Err(eyre!("Unknown corpus: {}", unknown));
    }
    let nodes = parse_nodes(query)?;

    let count: u64 = corpora
      .iter()
      .map(|corpus| pseudo_count(corpus, query, nodes.len()))
      .sum();
    debug!(corpora = corpora.len(), nodes = nodes.len(), count, "Counted matches");
    Ok(count)
  }
}

/// Split a query into node terms.
///
/// Terms are separated by `&` outside of quotes and regex slashes. Terms
/// starting with `#` are operators between nodes and do not form nodes.
pub fn parse_nodes(query: &str) -> Result<Vec<QueryNode>> {
  if query.trim().is_empty() {
    return Err(eyre!("Empty query"));
  }

  let mut terms = Vec::new();
  let mut current = String::new();
  let mut delimiter: Option<char> = None;

  for c in query.chars() {
    match (delimiter, c) {
      (None, '"') | (None, '/') => {
        delimiter = Some(c);
        current.push(c);
      }
      (Some(open), _) if open == c => {
        delimiter = None;
        current.push(c);
      }
      (None, '&') => terms.push(std::mem::take(&mut current)),
      _ => current.push(c),
    }
  }
  if let Some(open) = delimiter {
    return Err(eyre!("Unbalanced {} in query", open));
  }
  terms.push(current);

  let mut nodes = Vec::new();
  for (position, term) in terms.iter().map(|t| t.trim()).enumerate() {
    if term.is_empty() {
      return Err(eyre!("Empty term at position {}", position + 1));
    }
    if term.starts_with('#') {
      continue;
    }
    nodes.push(QueryNode {
      variable: format!("#{}", nodes.len() + 1),
      expression: term.to_string(),
    });
  }

  if nodes.is_empty() {
    return Err(eyre!("Query has no nodes"));
  }
  Ok(nodes)
}

/// Deterministic stand-in for a match count.
fn pseudo_count(corpus: &str, query: &str, nodes: usize) -> u64 {
  let mut hasher = Sha256::new();
  hasher.update(corpus.as_bytes());
  hasher.update([0]);
  hasher.update(query.trim().as_bytes());
  let digest = hasher.finalize();
  let raw = u64::from(u16::from_be_bytes([digest[0], digest[1]]));
  // More nodes, fewer matches
  raw / nodes as u64
}

#[cfg(test)]
mod tests {
  use super::*;

  fn backend() -> CorpusBackend {
    CorpusBackend::new(&BackendConfig {
      corpora: vec!["pcc2".to_string(), "GUM".to_string()],
      count_latency_ms: 100,
      node_latency_ms: 10,
    })
  }

  #[test]
  fn test_parse_single_node() {
    let nodes = parse_nodes(r#"tok="house""#).unwrap();
    assert_eq!(
      nodes,
      vec![QueryNode {
        variable: "#1".to_string(),
        expression: r#"tok="house""#.to_string(),
      }]
    );
  }

  #[test]
  fn test_parse_skips_operators() {
    let nodes = parse_nodes(r#"pos="NN" & lemma=/h.*/ & #1 . #2"#).unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1].variable, "#2");
    assert_eq!(nodes[1].expression, "lemma=/h.*/");
  }

  #[test]
  fn test_parse_ampersand_inside_quotes() {
    let nodes = parse_nodes(r#"tok="R&D""#).unwrap();
    assert_eq!(nodes.len(), 1);
  }

  #[test]
  fn test_parse_errors() {
    assert!(parse_nodes("   ").is_err());
    assert!(parse_nodes(r#"tok="open"#).is_err());
    assert!(parse_nodes("tok & & pos").is_err());
    assert!(parse_nodes("#1 . #2").is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_count_is_deterministic() {
    let backend = backend();
    let corpora = vec!["pcc2".to_string()];
    let a = backend.count_matches(&corpora, "tok").await.unwrap();
    let b = backend.count_matches(&corpora, " tok ").await.unwrap();
    assert_eq!(a, b);
  }

  #[tokio::test(start_paused = true)]
  async fn test_count_rejects_bad_corpora() {
    let backend = backend();
    assert!(backend.count_matches(&[], "tok").await.is_err());
    assert!(backend
      .count_matches(&["missing".to_string()], "tok")
      .await
      .is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_count_latency() {
    let backend = backend();
    let start = tokio::time::Instant::now();
    backend
      .count_matches(&["GUM".to_string()], "tok")
      .await
      .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
  }
}
