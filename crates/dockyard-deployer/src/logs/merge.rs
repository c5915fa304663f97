//! Timestamp-ordered merge of log lines from concurrent replicas.
//!
//! Lines are held in a min-heap for a short window so that a line arriving
//! slightly late can still be emitted before later ones. Ordering is only
//! guaranteed within the hold window.

use dockyard_core::log::LogLine;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    /// How long a line may wait for earlier ones.
    pub hold: Duration,
    /// Lines held at once; past this the earliest is emitted immediately.
    pub capacity: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            hold: Duration::from_millis(300),
            capacity: 64,
        }
    }
}

struct Held {
    seq: u64,
    line: LogLine,
}

impl Held {
    fn key(&self) -> (chrono::DateTime<chrono::Utc>, u64) {
        (self.line.timestamp, self.seq)
    }
}

impl PartialEq for Held {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Held {}

impl PartialOrd for Held {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Held {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct MergeState<S> {
    input: Option<S>,
    heap: BinaryHeap<Reverse<Held>>,
    /// One release deadline per held line, in arrival order.
    deadlines: VecDeque<Instant>,
    seq: u64,
    options: MergeOptions,
}

impl<S> MergeState<S> {
    fn hold(&mut self, line: LogLine) {
        self.seq += 1;
        self.heap.push(Reverse(Held {
            seq: self.seq,
            line,
        }));
        self.deadlines.push_back(Instant::now() + self.options.hold);
    }

    fn release(&mut self) -> Option<LogLine> {
        self.deadlines.pop_front();
        self.heap.pop().map(|Reverse(held)| held.line)
    }
}

/// Reorder `input` by embedded timestamp within `options.hold`. When the
/// input ends the remaining lines are emitted in timestamp order.
pub fn merge_ordered<S>(input: S, options: MergeOptions) -> BoxStream<'static, LogLine>
where
    S: Stream<Item = LogLine> + Send + Unpin + 'static,
{
    let state = MergeState {
        input: Some(input),
        heap: BinaryHeap::new(),
        deadlines: VecDeque::new(),
        seq: 0,
        options: MergeOptions {
            capacity: options.capacity.max(1),
            ..options
        },
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            let Some(input) = state.input.as_mut() else {
                return state.release().map(|line| (line, state));
            };

            let deadline = state.deadlines.front().copied();
            tokio::select! {
                next = input.next() => match next {
                    Some(line) => {
                        state.hold(line);
                        if state.heap.len() > state.options.capacity {
                            return state.release().map(|line| (line, state));
                        }
                    }
                    None => state.input = None,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return state.release().map(|line| (line, state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dockyard_core::log::LogLevel;
    use futures::SinkExt;
    use futures::channel::mpsc;

    fn line(at: i64) -> LogLine {
        LogLine {
            timestamp: Utc.timestamp_opt(at, 0).unwrap(),
            level: LogLevel::Stdout,
            message: at.to_string(),
        }
    }

    fn messages(lines: &[LogLine]) -> Vec<&str> {
        lines.iter().map(|l| l.message.as_str()).collect()
    }

    #[tokio::test]
    async fn test_out_of_order_within_hold_window() {
        let (mut tx, rx) = mpsc::channel(8);
        let mut merged = merge_ordered(
            rx,
            MergeOptions {
                hold: Duration::from_millis(200),
                capacity: 64,
            },
        );

        tx.send(line(100)).await.unwrap();
        tx.send(line(102)).await.unwrap();
        tx.send(line(101)).await.unwrap();

        // The sender stays open, so lines leave through the hold timer.
        let mut out = Vec::new();
        for _ in 0..3 {
            let next = tokio::time::timeout(Duration::from_secs(5), merged.next())
                .await
                .unwrap()
                .unwrap();
            out.push(next);
        }
        assert_eq!(messages(&out), vec!["100", "101", "102"]);
        drop(tx);
        assert!(merged.next().await.is_none());
    }

    #[tokio::test]
    async fn test_end_of_stream_flushes_in_order() {
        let input = futures::stream::iter(vec![line(5), line(3), line(4), line(1)]);
        let out: Vec<LogLine> = merge_ordered(
            input,
            MergeOptions {
                hold: Duration::from_secs(60),
                capacity: 64,
            },
        )
        .collect()
        .await;
        assert_eq!(messages(&out), vec!["1", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_overflow_releases_earliest_immediately() {
        let (mut tx, rx) = mpsc::channel(8);
        let mut merged = merge_ordered(
            rx,
            MergeOptions {
                hold: Duration::from_secs(60),
                capacity: 2,
            },
        );

        tx.send(line(300)).await.unwrap();
        tx.send(line(100)).await.unwrap();
        tx.send(line(200)).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), merged.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message, "100");

        drop(tx);
        let rest: Vec<LogLine> = merged.collect().await;
        assert_eq!(messages(&rest), vec!["200", "300"]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_arrival_order() {
        let mut a = line(7);
        a.message = "a".to_string();
        let mut b = line(7);
        b.message = "b".to_string();

        let out: Vec<LogLine> =
            merge_ordered(futures::stream::iter(vec![a, b]), MergeOptions::default())
                .collect()
                .await;
        assert_eq!(messages(&out), vec!["a", "b"]);
    }
}
