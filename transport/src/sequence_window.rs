use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use crate::error::{TransferError, TransferResult};

/// Sequence numbers are a single byte on the wire
const NUM_SEQUENCES: usize = 256;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WindowEntry<M> {
    Message(M),
    /// end of the stream, sent exactly once
    Terminal,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SequencedMessage<M> {
    pub seq: u8,
    pub entry: WindowEntry<M>,
}

/// Flow control for a stream of messages that the receiver acknowledges cumulatively by the
///  last sequence number it received.
///
/// Sequence numbers wrap at 256. An acknowledgement is only accepted if it lies in
///  `(last_acked, last_acked + window_size]` modulo 256; anything else is stale (a duplicate or a
///  delayed packet) and is ignored.
pub struct SequenceWindow<M> {
    window_size: usize,
    next_seq: u8,
    last_acked: u8,
    /// oldest first
    pending: VecDeque<SequencedMessage<M>>,
    terminal_sent: bool,
}

impl<M> SequenceWindow<M> {
    /// NB: the window size is validated as part of the transfer configuration
    pub fn new(window_size: usize) -> SequenceWindow<M> {
        assert!(window_size > 0 && window_size < NUM_SEQUENCES);

        SequenceWindow {
            window_size,
            next_seq: 0,
            last_acked: (NUM_SEQUENCES - 1) as u8,
            pending: VecDeque::with_capacity(window_size),
            terminal_sent: false,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.window_size
    }

    pub fn last_acked(&self) -> u8 {
        self.last_acked
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    /// All messages that are not acknowledged yet, oldest first. These are (re)sent whenever the
    ///  receiver asks for more data.
    pub fn pending(&self) -> impl Iterator<Item = &SequencedMessage<M>> {
        self.pending.iter()
    }

    fn push(&mut self, entry: WindowEntry<M>) -> TransferResult<u8> {
        if self.is_full() {
            return Err(TransferError::WindowFull { window_size: self.window_size });
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.pending.push_back(SequencedMessage { seq, entry });
        Ok(seq)
    }

    /// Returns the sequence number assigned to the message
    pub fn enqueue(&mut self, message: M) -> TransferResult<u8> {
        self.push(WindowEntry::Message(message))
    }

    /// Appends the end-of-stream marker and returns its sequence number. Subsequent calls have
    ///  no effect and return `None`.
    pub fn send_terminal(&mut self) -> TransferResult<Option<u8>> {
        if self.terminal_sent {
            return Ok(None);
        }
        let seq = self.push(WindowEntry::Terminal)?;
        debug!("terminal marker has sequence number {}", seq);
        self.terminal_sent = true;
        Ok(Some(seq))
    }

    /// Returns `true` if the acknowledgement was accepted, `false` if it was outside the window
    pub fn acknowledge(&mut self, reported_seq: u8) -> bool {
        let offset = reported_seq.wrapping_sub(self.last_acked) as usize;
        if offset == 0 || offset > self.window_size {
            trace!("ignoring acknowledgement {} outside the window after {}", reported_seq, self.last_acked);
            return false;
        }

        let prev = self.last_acked;
        if reported_seq < prev {
            // the window wraps: first everything up to 255, then from 0 to the reported number
            while self.pending.front().is_some_and(|m| m.seq > prev) {
                self.pending.pop_front();
            }
            while self.pending.front().is_some_and(|m| m.seq <= reported_seq) {
                self.pending.pop_front();
            }
        }
        else {
            while self.pending.front().is_some_and(|m| m.seq > prev && m.seq <= reported_seq) {
                self.pending.pop_front();
            }
        }

        self.last_acked = reported_seq;
        true
    }
}

/// A sequence window shared between a sending task and a task processing acknowledgements
pub struct SharedSequenceWindow<M> {
    inner: Arc<Mutex<SequenceWindow<M>>>,
}

impl<M> Clone for SharedSequenceWindow<M> {
    fn clone(&self) -> Self {
        SharedSequenceWindow { inner: self.inner.clone() }
    }
}

impl<M: Clone + Send> SharedSequenceWindow<M> {
    pub fn new(window_size: usize) -> SharedSequenceWindow<M> {
        SharedSequenceWindow {
            inner: Arc::new(Mutex::new(SequenceWindow::new(window_size))),
        }
    }

    pub async fn enqueue(&self, message: M) -> TransferResult<u8> {
        self.inner.lock().await.enqueue(message)
    }

    pub async fn send_terminal(&self) -> TransferResult<Option<u8>> {
        self.inner.lock().await.send_terminal()
    }

    /// Applies the acknowledgement and returns a snapshot of what is still pending
    pub async fn acknowledge(&self, reported_seq: u8) -> (bool, Vec<SequencedMessage<M>>) {
        let mut window = self.inner.lock().await;
        let accepted = window.acknowledge(reported_seq);
        (accepted, window.pending().cloned().collect())
    }

    pub async fn pending(&self) -> Vec<SequencedMessage<M>> {
        self.inner.lock().await.pending().cloned().collect()
    }

    pub async fn is_full(&self) -> bool {
        self.inner.lock().await.is_full()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn terminal_sent(&self) -> bool {
        self.inner.lock().await.terminal_sent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pending_seqs<M>(window: &SequenceWindow<M>) -> Vec<u8> {
        window.pending().map(|m| m.seq).collect()
    }

    #[test]
    fn test_enqueue_until_full() {
        let mut window = SequenceWindow::new(4);
        for i in 0..4 {
            assert_eq!(window.enqueue(i * 10).unwrap(), i as u8);
        }
        assert!(window.is_full());
        match window.enqueue(99) {
            Err(TransferError::WindowFull { window_size: 4 }) => {}
            other => panic!("expected a full window, got {:?}", other),
        }
        assert_eq!(window.len(), 4);

        assert!(window.acknowledge(1));
        assert_eq!(pending_seqs(&window), vec![2, 3]);
        assert_eq!(window.enqueue(40).unwrap(), 4);
    }

    #[rstest]
    #[case::duplicate(255, false)]
    #[case::first(0, true)]
    #[case::edge_of_window(63, true)]
    #[case::beyond_window(64, false)]
    #[case::far_away(200, false)]
    fn test_acknowledge_window(#[case] reported: u8, #[case] accepted: bool) {
        let mut window = SequenceWindow::new(64);
        for i in 0..10 {
            window.enqueue(i).unwrap();
        }
        let before = pending_seqs(&window);

        assert_eq!(window.acknowledge(reported), accepted);
        if accepted {
            assert_eq!(window.last_acked(), reported);
        }
        else {
            assert_eq!(window.last_acked(), 255);
            assert_eq!(pending_seqs(&window), before);
        }
    }

    #[test]
    fn test_wraparound() {
        let mut window = SequenceWindow {
            window_size: 64,
            next_seq: 251,
            last_acked: 250,
            pending: VecDeque::new(),
            terminal_sent: false,
        };
        for i in 0..20 {
            window.enqueue(i).unwrap();
        }
        assert_eq!(window.pending().next().map(|m| m.seq), Some(251));
        assert_eq!(window.pending().last().map(|m| m.seq), Some(14));

        assert!(window.acknowledge(252));
        assert_eq!(window.pending().next().map(|m| m.seq), Some(253));

        assert!(window.acknowledge(255));
        assert_eq!(window.pending().next().map(|m| m.seq), Some(0));

        // stale, must not change anything
        assert!(!window.acknowledge(254));
        assert_eq!(window.pending().next().map(|m| m.seq), Some(0));

        assert!(window.acknowledge(3));
        assert_eq!(window.pending().next().map(|m| m.seq), Some(4));

        assert!(window.acknowledge(10));
        assert_eq!(pending_seqs(&window), vec![11, 12, 13, 14]);
    }

    #[test]
    fn test_wrapping_ack_prunes_both_halves() {
        let mut window = SequenceWindow {
            window_size: 64,
            next_seq: 251,
            last_acked: 250,
            pending: VecDeque::new(),
            terminal_sent: false,
        };
        for i in 0..20 {
            window.enqueue(i).unwrap();
        }
        assert!(window.acknowledge(2));
        assert_eq!(window.pending().next().map(|m| m.seq), Some(3));
        assert_eq!(window.len(), 12);
    }

    #[test]
    fn test_window_never_exceeds_size() {
        let mut window = SequenceWindow::new(8);
        let mut acked = 255u8;
        for round in 0..100u32 {
            while !window.is_full() {
                window.enqueue(round).unwrap();
            }
            assert!(window.enqueue(round).is_err());
            assert_eq!(window.len(), 8);

            acked = acked.wrapping_add(3);
            assert!(window.acknowledge(acked));
            assert_eq!(window.len(), 5);
        }
    }

    #[test]
    fn test_terminal_is_idempotent() {
        let mut window = SequenceWindow::<u32>::new(8);
        window.enqueue(1).unwrap();
        assert_eq!(window.send_terminal().unwrap(), Some(1));
        assert_eq!(window.send_terminal().unwrap(), None);
        assert!(window.terminal_sent());
        assert_eq!(window.len(), 2);
        assert_eq!(window.pending().last().map(|m| &m.entry), Some(&WindowEntry::Terminal));
    }

    #[test]
    fn test_terminal_on_full_window() {
        let mut window = SequenceWindow::<u32>::new(1);
        window.enqueue(1).unwrap();
        assert!(window.send_terminal().is_err());
        assert!(!window.terminal_sent());

        assert!(window.acknowledge(0));
        window.send_terminal().unwrap();
        assert!(window.terminal_sent());
    }

    #[tokio::test]
    async fn test_shared_window() {
        let window = SharedSequenceWindow::<u32>::new(4);
        let sender = window.clone();
        let handle = tokio::spawn(async move {
            for i in 0..4 {
                sender.enqueue(i).await.unwrap();
            }
        });
        handle.await.unwrap();

        assert!(window.is_full().await);
        let (accepted, pending) = window.acknowledge(1).await;
        assert!(accepted);
        assert_eq!(pending.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);
    }
}
