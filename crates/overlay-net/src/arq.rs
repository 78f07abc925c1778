//! Go-Back-N automatic repeat request
//!
//! [`GoBackNArqEngine`] gives reliable, in-order delivery over a link that may
//! drop or reorder frames. It only manages state; the caller moves
//! [`ArqSegment`]s over the wire and drives the retransmit timer by calling
//! [`GoBackNArqEngine::poll_timeout`] at [`GoBackNArqEngine::next_deadline`].
//!
//! # Protocol contract
//!
//! - Every data unit gets the next `u32` sequence number; numbers wrap.
//! - At most `window_size` segments are unacknowledged at once. Further sends
//!   wait in an overflow queue bounded by `max_pending`.
//! - Acknowledgments are cumulative: `Ack { seq }` confirms every segment up
//!   to and including `seq`.
//! - The receiver accepts only the next expected sequence. Duplicates and
//!   segments after a gap are not delivered; both trigger a repeat of the
//!   last contiguous acknowledgment.
//! - On timeout the sender retransmits the whole window from the oldest
//!   unacknowledged segment onward.

use crate::framing::{Frame, FrameError, FrameKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// ARQ tuning parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArqConfig {
    /// Maximum number of unacknowledged segments
    pub window_size: usize,
    /// Time without progress before the window is retransmitted
    #[serde(with = "crate::config::millis")]
    pub retry_timeout: Duration,
    /// Maximum number of segments waiting for a window slot
    pub max_pending: usize,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            window_size: 16,
            retry_timeout: Duration::from_millis(250),
            max_pending: 1024,
        }
    }
}

/// ARQ errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArqError {
    #[error("send queue full ({0} segments pending)")]
    Backpressure(usize),
}

/// `true` when `a` precedes `b` in serial-number space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < (1 << 31)
}

/// `true` when `a` precedes or equals `b` in serial-number space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// A unit exchanged by two ARQ endpoints
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArqSegment {
    Data { seq: u32, payload: Bytes },
    Ack { seq: u32 },
}

impl ArqSegment {
    /// Encode as a wire frame (`u32` sequence header, then opaque payload)
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Data { seq, payload } => {
                let mut body = BytesMut::with_capacity(4 + payload.len());
                body.put_u32(*seq);
                body.put_slice(payload);
                Frame::new(FrameKind::ArqData, body.freeze())
            }
            Self::Ack { seq } => {
                Frame::new(FrameKind::ArqAck, Bytes::copy_from_slice(&seq.to_be_bytes()))
            }
        }
    }

    /// Decode from a wire frame
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let mut body = frame.body.clone();
        match frame.kind {
            FrameKind::ArqData if body.len() >= 4 => {
                let seq = body.get_u32();
                Ok(Self::Data { seq, payload: body })
            }
            FrameKind::ArqAck if body.len() == 4 => Ok(Self::Ack { seq: body.get_u32() }),
            FrameKind::ArqData | FrameKind::ArqAck => Err(FrameError::Malformed {
                kind: frame.kind,
                reason: format!("{} byte body", body.len()),
            }),
            other => Err(FrameError::Malformed {
                kind: other,
                reason: "not an ARQ frame".into(),
            }),
        }
    }

    /// Sequence number carried by the segment
    pub fn seq(&self) -> u32 {
        match self {
            Self::Data { seq, .. } | Self::Ack { seq } => *seq,
        }
    }
}

#[derive(Debug)]
struct InFlight<T> {
    seq: u32,
    payload: Bytes,
    token: T,
    tx_count: u32,
}

/// Send side of Go-Back-N.
///
/// `T` is an opaque token handed back when its segment is acknowledged or
/// when the sender is failed; the direct channel uses it to complete
/// delivery receipts.
///
/// ```text
///  ack_sequence       send_sequence
///      │                  │
///  ────┼──────────────────┼──────────────────▶ seq space
///      │ <── in flight ──▶│ <── overflow ───▶
/// ```
#[derive(Debug)]
pub struct GoBackNSender<T> {
    base: u32,
    next_seq: u32,
    window_size: usize,
    max_pending: usize,
    retry_timeout: Duration,
    window: VecDeque<InFlight<T>>,
    overflow: VecDeque<(Bytes, T)>,
    deadline: Option<Instant>,
}

impl<T> GoBackNSender<T> {
    pub fn new(config: &ArqConfig) -> Self {
        Self::starting_at(config, 0)
    }

    /// Sender whose first segment uses `seq`
    pub fn starting_at(config: &ArqConfig, seq: u32) -> Self {
        Self {
            base: seq,
            next_seq: seq,
            window_size: config.window_size.max(1),
            max_pending: config.max_pending,
            retry_timeout: config.retry_timeout,
            window: VecDeque::with_capacity(config.window_size.max(1)),
            overflow: VecDeque::new(),
            deadline: None,
        }
    }

    /// Oldest unacknowledged sequence number
    pub fn ack_sequence(&self) -> u32 {
        self.base
    }

    /// Sequence number the next new segment will get
    pub fn send_sequence(&self) -> u32 {
        self.next_seq
    }

    /// Segments awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    /// Segments waiting for a window slot
    pub fn pending(&self) -> usize {
        self.overflow.len()
    }

    /// Retransmit deadline, if the window is non-empty
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Transmission count of the oldest unacknowledged segment
    pub fn oldest_tx_count(&self) -> Option<u32> {
        self.window.front().map(|e| e.tx_count)
    }

    /// Whether another [`GoBackNSender::enqueue`] would be refused
    pub fn is_saturated(&self) -> bool {
        self.window.len() >= self.window_size && self.overflow.len() >= self.max_pending
    }

    /// Queue a payload; returns the segments that may go out now.
    pub fn enqueue(
        &mut self,
        payload: Bytes,
        token: T,
        now: Instant,
    ) -> Result<Vec<ArqSegment>, ArqError> {
        if self.window.len() >= self.window_size && self.overflow.len() >= self.max_pending {
            return Err(ArqError::Backpressure(self.overflow.len()));
        }
        self.overflow.push_back((payload, token));
        Ok(self.fill_window(now))
    }

    /// Process a cumulative acknowledgment.
    ///
    /// Returns the tokens of newly acknowledged segments and the segments
    /// that moved from the overflow queue into the window. Stale or
    /// out-of-range acknowledgments change nothing.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> (Vec<T>, Vec<ArqSegment>) {
        if !seq_le(self.base, ack) || !seq_lt(ack, self.next_seq) {
            return (Vec::new(), Vec::new());
        }

        let mut acknowledged = Vec::new();
        while let Some(front) = self.window.front() {
            if !seq_le(front.seq, ack) {
                break;
            }
            if let Some(entry) = self.window.pop_front() {
                acknowledged.push(entry.token);
            }
        }
        self.base = ack.wrapping_add(1);

        // Progress re-arms the timer for whatever is still outstanding.
        self.deadline = if self.window.is_empty() {
            None
        } else {
            Some(now + self.retry_timeout)
        };

        let transmit = self.fill_window(now);
        (acknowledged, transmit)
    }

    /// Retransmit the whole window if the deadline has passed.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<ArqSegment> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Vec::new(),
        }

        self.deadline = Some(now + self.retry_timeout);
        self.window
            .iter_mut()
            .map(|entry| {
                entry.tx_count += 1;
                ArqSegment::Data {
                    seq: entry.seq,
                    payload: entry.payload.clone(),
                }
            })
            .collect()
    }

    /// Drop every queued and in-flight segment, returning their tokens in
    /// send order.
    pub fn fail_all(&mut self) -> Vec<T> {
        self.deadline = None;
        let mut tokens: Vec<T> = self.window.drain(..).map(|e| e.token).collect();
        tokens.extend(self.overflow.drain(..).map(|(_, token)| token));
        tokens
    }

    fn fill_window(&mut self, now: Instant) -> Vec<ArqSegment> {
        let mut transmit = Vec::new();
        while self.window.len() < self.window_size {
            let Some((payload, token)) = self.overflow.pop_front() else {
                break;
            };
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            transmit.push(ArqSegment::Data {
                seq,
                payload: payload.clone(),
            });
            self.window.push_back(InFlight {
                seq,
                payload,
                token,
                tx_count: 1,
            });
        }
        if !self.window.is_empty() && self.deadline.is_none() {
            self.deadline = Some(now + self.retry_timeout);
        }
        transmit
    }
}

/// What the receiver did with a data segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Next expected segment, hand the payload to the consumer
    Delivered(Bytes),
    /// Already delivered earlier
    Duplicate,
    /// A gap precedes this segment; dropped
    OutOfOrder,
}

/// Receive side of Go-Back-N
#[derive(Debug)]
pub struct GoBackNReceiver {
    next_expected: u32,
}

impl GoBackNReceiver {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Receiver expecting `seq` first
    pub fn starting_at(seq: u32) -> Self {
        Self { next_expected: seq }
    }

    /// Next sequence number that will be accepted
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Highest contiguous sequence accepted so far
    pub fn last_contiguous(&self) -> u32 {
        self.next_expected.wrapping_sub(1)
    }

    /// Process a data segment; returns what happened and the sequence to
    /// acknowledge.
    pub fn on_data(&mut self, seq: u32, payload: Bytes) -> (ReceiveOutcome, u32) {
        if seq == self.next_expected {
            self.next_expected = self.next_expected.wrapping_add(1);
            return (ReceiveOutcome::Delivered(payload), seq);
        }

        let outcome = if seq_lt(seq, self.next_expected) {
            ReceiveOutcome::Duplicate
        } else {
            ReceiveOutcome::OutOfOrder
        };
        (outcome, self.last_contiguous())
    }
}

impl Default for GoBackNReceiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of feeding the engine
#[derive(Debug)]
pub struct ArqOutput<T> {
    /// Segments to put on the wire, in order
    pub transmit: Vec<ArqSegment>,
    /// Payloads for the consumer, in sequence order
    pub delivered: Vec<Bytes>,
    /// Tokens of segments the peer confirmed
    pub acknowledged: Vec<T>,
}

impl<T> Default for ArqOutput<T> {
    fn default() -> Self {
        Self {
            transmit: Vec::new(),
            delivered: Vec::new(),
            acknowledged: Vec::new(),
        }
    }
}

/// Both directions of one ARQ-protected connection
#[derive(Debug)]
pub struct GoBackNArqEngine<T = ()> {
    sender: GoBackNSender<T>,
    receiver: GoBackNReceiver,
}

impl<T> GoBackNArqEngine<T> {
    pub fn new(config: &ArqConfig) -> Self {
        Self::with_sequences(config, 0, 0)
    }

    /// Engine with explicit initial send and receive sequences
    pub fn with_sequences(config: &ArqConfig, send_start: u32, receive_start: u32) -> Self {
        Self {
            sender: GoBackNSender::starting_at(config, send_start),
            receiver: GoBackNReceiver::starting_at(receive_start),
        }
    }

    pub fn sender(&self) -> &GoBackNSender<T> {
        &self.sender
    }

    pub fn receiver(&self) -> &GoBackNReceiver {
        &self.receiver
    }

    /// Queue an outbound payload
    pub fn send(&mut self, payload: Bytes, token: T, now: Instant) -> Result<ArqOutput<T>, ArqError> {
        let transmit = self.sender.enqueue(payload, token, now)?;
        Ok(ArqOutput {
            transmit,
            ..ArqOutput::default()
        })
    }

    /// Process a segment received from the peer
    pub fn handle(&mut self, segment: ArqSegment, now: Instant) -> ArqOutput<T> {
        let mut output = ArqOutput::default();
        match segment {
            ArqSegment::Data { seq, payload } => {
                let (outcome, ack) = self.receiver.on_data(seq, payload);
                if let ReceiveOutcome::Delivered(payload) = outcome {
                    output.delivered.push(payload);
                }
                output.transmit.push(ArqSegment::Ack { seq: ack });
            }
            ArqSegment::Ack { seq } => {
                let (acknowledged, transmit) = self.sender.on_ack(seq, now);
                output.acknowledged = acknowledged;
                output.transmit = transmit;
            }
        }
        output
    }

    /// Retransmit deadline of the send window
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sender.next_deadline()
    }

    /// Fire the retransmit timer if due
    pub fn poll_timeout(&mut self, now: Instant) -> ArqOutput<T> {
        ArqOutput {
            transmit: self.sender.on_timeout(now),
            ..ArqOutput::default()
        }
    }

    /// Abandon all outstanding sends
    pub fn fail_all(&mut self) -> Vec<T> {
        self.sender.fail_all()
    }
}
