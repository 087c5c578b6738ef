use std::collections::VecDeque;
use anyhow::anyhow;
use buffering::pending_payload::{EVENT_HEADER_BYTES, KEY_BYTES};
use buffering::send_buffers::BufferedSource;
use tracing::{debug, info, trace};
use transport::core_location::CoreLocation;
use transport::error::{TransferError, TransferResult};
use transport::event_frame::{encode_event, encode_event_stop, BufferRequest};
use transport::frame::{Datagram, FrameCodec};
use transport::retry::{await_reply, WaitOutcome};
use transport::sequence_window::{SequencedMessage, SharedSequenceWindow, WindowEntry};
use transport::session::TransferContext;

/// A single event message: keys that are due at a timestamp, at most as many as fit into one
///  message
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EventMessage {
    pub timestamp: u32,
    pub keys: Vec<u32>,
}

impl EventMessage {
    /// the bytes the message takes up in the device's buffer
    pub fn encoded_size(&self) -> usize {
        EVENT_HEADER_BYTES + self.keys.len() * KEY_BYTES
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct EventStreamStats {
    pub messages: usize,
    pub keys: usize,
    /// messages sent again because they were not acknowledged in time
    pub retransmissions: usize,
    pub stale_acknowledgements: usize,
}

/// Delivers a region's timed keys to a device while the application runs.
///
/// Messages go through a [SharedSequenceWindow]: at most `window_size` are unacknowledged at
///  any time, and the device's `REQUEST_BUFFERS` acknowledges cumulatively and reports how much
///  space its buffer has left. Messages are only sent if they fit into that space. Until the
///  device's first report, the space is the size of its buffer, so a message that does not fit
///  with nothing in flight can never be delivered and fails the stream. After a report, the
///  stream waits for the device to report more space. When a
///  receive times out, all unacknowledged messages are sent again. The stream ends with an
///  `EVENT_STOP` marker once the source is exhausted, and is complete when the marker is
///  acknowledged.
pub struct EventStream {
    core: CoreLocation,
    region: u8,
    /// the address of the device buffer, for diagnostics
    region_address: u32,
    /// the size of the region's complete payload, for diagnostics
    region_length: u32,
    window: SharedSequenceWindow<EventMessage>,
    /// messages taken from the source but not sent yet
    staged: VecDeque<EventMessage>,
    space_available: usize,
    /// false while `space_available` is the initial buffer size
    space_reported: bool,
    stats: EventStreamStats,
}

impl EventStream {
    pub fn new(core: CoreLocation, region: u8, region_address: u32, window_size: usize, initial_space: usize) -> EventStream {
        EventStream {
            core,
            region,
            region_address,
            region_length: 0,
            window: SharedSequenceWindow::new(window_size),
            staged: VecDeque::new(),
            space_available: initial_space,
            space_reported: false,
            stats: EventStreamStats::default(),
        }
    }

    /// A handle to observe the stream's progress from another task
    pub fn window(&self) -> SharedSequenceWindow<EventMessage> {
        self.window.clone()
    }

    fn encode(&self, codec: &FrameCodec, transaction_id: u32, message: &SequencedMessage<EventMessage>) -> Datagram {
        match &message.entry {
            WindowEntry::Message(m) => encode_event(codec, transaction_id, self.region, message.seq, m.timestamp, &m.keys),
            WindowEntry::Terminal => encode_event_stop(codec, transaction_id, self.region, message.seq),
        }
    }

    /// Moves messages from the source into the window and sends them, as far as the window and
    ///  the device's space allow
    async fn fill(&mut self, ctx: &TransferContext<'_>, source: &mut dyn BufferedSource, transaction_id: u32) -> TransferResult<()> {
        let codec = ctx.codec();
        loop {
            if self.window.is_full().await {
                return Ok(());
            }

            if self.staged.is_empty() {
                match source.next_ready(self.region) {
                    Some(timed) => {
                        self.staged.extend(timed.messages().map(|keys| EventMessage {
                            timestamp: timed.timestamp,
                            keys: keys.to_vec(),
                        }));
                        continue;
                    }
                    None => {
                        if let Some(seq) = self.window.send_terminal().await? {
                            debug!("all events of {} region {} sent, stopping", self.core, self.region);
                            ctx.send(&encode_event_stop(&codec, transaction_id, self.region, seq)).await?;
                        }
                        return Ok(());
                    }
                }
            }

            let Some(message) = self.staged.front() else { return Ok(()); };
            let size = message.encoded_size();
            if size > self.space_available {
                if self.window.is_empty().await {
                    if !self.space_reported {
                        return Err(TransferError::Device(anyhow!(
                            "{} region {}: a message of {} bytes does not fit into the device buffer of {} bytes",
                            self.core, self.region, size, self.space_available)));
                    }
                    debug!("nothing in flight, waiting for {} region {} to report more than {} bytes of space", self.core, self.region, self.space_available);
                }
                else {
                    trace!("waiting for space: message needs {} bytes, {} available", size, self.space_available);
                }
                return Ok(());
            }

            let seq = match self.window.enqueue(message.clone()).await {
                Ok(seq) => seq,
                Err(TransferError::WindowFull { .. }) => return Ok(()),
                Err(e) => return Err(e),
            };
            ctx.send(&encode_event(&codec, transaction_id, self.region, seq, message.timestamp, &message.keys)).await?;

            self.stats.messages += 1;
            self.stats.keys += message.keys.len();
            self.space_available -= size;
            self.staged.pop_front();
        }
    }

    fn on_buffer_request(&mut self, request: BufferRequest, pending: &[SequencedMessage<EventMessage>]) {
        let in_flight = pending.iter()
            .map(|m| match &m.entry {
                WindowEntry::Message(m) => m.encoded_size(),
                WindowEntry::Terminal => 0,
            })
            .sum::<usize>();
        self.space_available = (request.space_available as usize).saturating_sub(in_flight);
        self.space_reported = true;
        trace!("device acknowledged {}, {} bytes available", request.last_received_seq, self.space_available);
    }

    /// Runs the stream until the device acknowledged the end marker
    pub async fn run(&mut self, ctx: &TransferContext<'_>, source: &mut dyn BufferedSource, transaction_id: u32) -> TransferResult<EventStreamStats> {
        let codec = ctx.codec();
        let mut retry = ctx.retry_state();
        self.region_length = source.required_sdram(self.region)
            .map(|(_, total)| total as u32)
            .unwrap_or(0);

        info!("streaming {} bytes of events into {} region {}", self.region_length, self.core, self.region);

        loop {
            self.fill(ctx, source, transaction_id).await?;
            if self.window.terminal_sent().await && self.window.is_empty().await {
                info!("event stream into {} region {} is complete: {} messages, {} keys", self.core, self.region, self.stats.messages, self.stats.keys);
                return Ok(self.stats.clone());
            }

            let raw = match await_reply(ctx.clock, ctx.cancel, retry.current_timeout(), ctx.socket.recv()).await {
                WaitOutcome::Ready(raw) => raw?,
                WaitOutcome::Cancelled => return Err(TransferError::Cancelled {
                    core: self.core,
                    address: self.region_address,
                    length: self.region_length,
                }),
                WaitOutcome::TimedOut => {
                    if !retry.on_timeout() {
                        ctx.log_core_diagnostics(self.core).await;
                        return Err(TransferError::TransferTimeout {
                            core: self.core,
                            address: self.region_address,
                            length: self.region_length,
                            attempts: retry.timeouts(),
                        });
                    }

                    let pending = self.window.pending().await;
                    debug!("timeout #{}, re-sending {} unacknowledged messages", retry.timeouts(), pending.len());
                    let datagrams = pending.iter()
                        .map(|m| self.encode(&codec, transaction_id, m))
                        .collect::<Vec<_>>();
                    ctx.send_throttled(&datagrams, ctx.config.send_delay).await?;
                    self.stats.retransmissions += datagrams.len();
                    continue;
                }
            };

            let frame = match codec.decode(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("dropping datagram: {}", e);
                    continue;
                }
            };
            if frame.transaction_id != transaction_id {
                trace!("dropping stale frame of transaction {}", frame.transaction_id);
                continue;
            }
            let Some(request) = BufferRequest::parse(&frame) else {
                debug!("ignoring unexpected {:?} during event streaming", frame.command);
                continue;
            };
            if request.region != self.region {
                trace!("ignoring buffer request for region {}", request.region);
                continue;
            }

            let (accepted, pending) = self.window.acknowledge(request.last_received_seq).await;
            if !accepted {
                trace!("ignoring stale acknowledgement {}", request.last_received_seq);
                self.stats.stale_acknowledgements += 1;
                continue;
            }
            retry.reset();
            self.on_buffer_request(request, &pending);
        }
    }
}
