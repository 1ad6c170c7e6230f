//! Diagnostic transcript observed by front ends.
//!
//! Each line is mirrored to `tracing`. Nobody has to subscribe for writers to
//! make progress. Only the most recent lines are kept.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_CAPACITY: usize = 200;

/// Snapshot of the retained lines. `generation` changes on every reset;
/// `start` is the absolute index of the oldest retained line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    generation: u64,
    start: u64,
    lines: VecDeque<String>,
}

impl Transcript {
    fn end(&self) -> u64 {
        self.start + self.lines.len() as u64
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    tx: Arc<watch::Sender<Transcript>>,
    capacity: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = watch::channel(Transcript::default());
        Diagnostics {
            tx: Arc::new(tx),
            capacity: capacity.max(1),
        }
    }

    /// Starts a fresh transcript with `line`.
    pub fn reset(&self, line: &str) {
        info!(target: "tailcontrol::diag", "{line}");
        self.tx.send_modify(|t| {
            t.generation += 1;
            t.start = 0;
            t.lines.clear();
            t.lines.push_back(line.to_string());
        });
    }

    pub fn append(&self, line: &str) {
        info!(target: "tailcontrol::diag", "{line}");
        self.push(line.to_string());
    }

    pub fn error(&self, line: &str) {
        warn!(target: "tailcontrol::diag", "{line}");
        self.push(format!("ERROR: {line}"));
    }

    fn push(&self, line: String) {
        let capacity = self.capacity;
        self.tx.send_modify(|t| {
            t.lines.push_back(line);
            while t.lines.len() > capacity {
                t.lines.pop_front();
                t.start += 1;
            }
        });
    }

    /// Retained lines joined by newlines.
    pub fn contents(&self) -> String {
        self.tx.borrow().to_string()
    }

    pub fn subscribe(&self) -> watch::Receiver<Transcript> {
        self.tx.subscribe()
    }
}

/// Yields the lines added since the previous call. After a
/// [`Diagnostics::reset`] the whole new transcript is returned.
#[derive(Debug, Default)]
pub struct Tail {
    seen: Option<(u64, u64)>,
}

impl Tail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, transcript: &Transcript) -> Vec<String> {
        let from = match self.seen {
            Some((generation, next)) if generation == transcript.generation => {
                next.max(transcript.start)
            }
            _ => transcript.start,
        };
        self.seen = Some((transcript.generation, transcript.end()));
        transcript
            .lines
            .iter()
            .skip(from.saturating_sub(transcript.start) as usize)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_without_subscribers() {
        let diag = Diagnostics::new();
        diag.append("one");
        diag.error("two");
        assert_eq!(diag.contents(), "one\nERROR: two");

        diag.reset("fresh");
        assert_eq!(diag.contents(), "fresh");
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let diag = Diagnostics::new();
        let mut rx = diag.subscribe();
        diag.append("started");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().to_string(), "started");
    }

    #[test]
    fn old_lines_are_dropped() {
        let diag = Diagnostics::with_capacity(3);
        for i in 0..10 {
            diag.append(&format!("line {i}"));
        }
        assert_eq!(diag.contents(), "line 7\nline 8\nline 9");
    }

    #[test]
    fn tail_returns_new_lines() {
        let diag = Diagnostics::with_capacity(3);
        let rx = diag.subscribe();
        let mut tail = Tail::new();

        diag.append("a");
        assert_eq!(tail.advance(&rx.borrow()), ["a"]);
        diag.append("b");
        assert_eq!(tail.advance(&rx.borrow()), ["b"]);
        assert!(tail.advance(&rx.borrow()).is_empty());

        // lines evicted before being read are skipped
        for line in ["c", "d", "e", "f"] {
            diag.append(line);
        }
        assert_eq!(tail.advance(&rx.borrow()), ["d", "e", "f"]);
    }

    #[test]
    fn tail_restarts_after_reset_even_when_longer() {
        let diag = Diagnostics::new();
        let rx = diag.subscribe();
        let mut tail = Tail::new();

        diag.append("x");
        assert_eq!(tail.advance(&rx.borrow()), ["x"]);

        diag.reset("Tailscale status: Running");
        diag.append("execute: nohup tailscale file get");
        assert_eq!(
            tail.advance(&rx.borrow()),
            ["Tailscale status: Running", "execute: nohup tailscale file get"]
        );
    }
}
