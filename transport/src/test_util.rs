//! A simulated machine for testing code that moves data: memory per chip, monitor cores that
//!  speak the streaming protocol over an in-process channel, direct memory access and the
//!  router / reinjection controls.
//!
//! This is regular (non-#[cfg(test)]) code so that crates built on top of the transport can use
//!  it for their own tests.

use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use bit_set::BitSet;
use bytes::Bytes;
use rand::RngCore;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::trace;
use crate::commands::CommandId;
use crate::core_location::{ChipLocation, CoreLocation};
use crate::datagram_socket::{DatagramConnector, DatagramSocket};
use crate::device_access::{CoreState, DeviceAccess};
use crate::event_frame::{encode_buffer_request, BufferRequest, SequencedEvent};
use crate::frame::{Datagram, Frame, FrameCodec};
use crate::missing_report::{encode_device_missing_report, HostReportAssembler, MISSING_SEQ_END_FLAG};
use crate::monitor::{ReinjectionControllable, ReinjectionFlags, ReinjectionStatus, RouterTimeout, RouterWait};
use crate::safe_converter::SafeCast;

/// The space a simulated monitor reports as available in an event region
pub const SIMULATED_EVENT_SPACE: u32 = 8192;

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut result = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut result);
    result
}

/// Scripted misbehavior of a simulated monitor
#[derive(Debug, Clone, Default)]
pub struct SimulatorBehavior {
    /// data chunks (in either direction) and event messages that are lost the first time they
    ///  are sent
    pub drop_once: FxHashSet<u32>,
    /// every data chunk sent by the monitor arrives twice
    pub duplicate_all: bool,
    /// the number of start packets that are lost before one gets through
    pub ignore_starts: u32,
    /// the monitor never replies
    pub silent: bool,
    /// the monitor sends (extraction) or reports (injection) this sequence number once
    pub insane_sequence: Option<u32>,
    /// the monitor interleaves packets of an unrelated transaction
    pub stale_transaction_noise: bool,
    /// the number of injection replies that are lost
    pub drop_replies: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MonitorCall {
    SetRouterTimeout(RouterWait, RouterTimeout),
    SetReinjection(ReinjectionFlags),
    ClearReinjectionQueue,
    InstallApplicationRoutes,
    InstallSystemRoutes,
    ReinjectionStatus,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub starts: u32,
    pub clears: u32,
    /// complete missing reports received from the host
    pub missing_reports: u32,
    /// the sequence numbers each of those reports asked for
    pub requested_missing: Vec<Vec<u32>>,
    pub data_packets_received: u32,
    pub core_state_reads: u32,
    pub direct_reads: u32,
    pub direct_writes: u32,
    pub connections: u32,
    /// event messages accepted in sequence, including end markers
    pub events_accepted: u32,
    pub monitor_calls: Vec<MonitorCall>,
}

struct MachineState {
    memory: FxHashMap<ChipLocation, FxHashMap<u32, u8>>,
    behaviors: FxHashMap<CoreLocation, SimulatorBehavior>,
    stats: SimulatorStats,
    wait1: RouterTimeout,
    wait2: RouterTimeout,
    reinjection: ReinjectionFlags,
    fail_monitor_calls: bool,
    events: FxHashMap<(CoreLocation, u8), Vec<(u32, Vec<u32>)>>,
    stopped_event_regions: FxHashSet<(CoreLocation, u8)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared state of the simulated machine. Clones refer to the same machine.
#[derive(Clone)]
pub struct SimulatedMachine {
    codec: FrameCodec,
    state: Arc<Mutex<MachineState>>,
}

impl SimulatedMachine {
    pub fn new(datagram_capacity: usize) -> SimulatedMachine {
        SimulatedMachine {
            codec: FrameCodec::new(datagram_capacity),
            state: Arc::new(Mutex::new(MachineState {
                memory: FxHashMap::default(),
                behaviors: FxHashMap::default(),
                stats: SimulatorStats::default(),
                wait1: RouterTimeout::TEMP,
                wait2: RouterTimeout::ZERO,
                reinjection: ReinjectionFlags::all(),
                fail_monitor_calls: false,
                events: FxHashMap::default(),
                stopped_event_regions: FxHashSet::default(),
            })),
        }
    }

    pub fn write(&self, chip: ChipLocation, address: u32, data: &[u8]) {
        let mut state = lock(&self.state);
        let memory = state.memory.entry(chip).or_default();
        for (i, &b) in data.iter().enumerate() {
            memory.insert(address.wrapping_add(i as u32), b);
        }
    }

    /// Unwritten memory reads as zero
    pub fn read(&self, chip: ChipLocation, address: u32, len: usize) -> Bytes {
        let state = lock(&self.state);
        let memory = state.memory.get(&chip);
        (0..len)
            .map(|i| memory
                .and_then(|m| m.get(&address.wrapping_add(i as u32)))
                .copied()
                .unwrap_or(0))
            .collect::<Vec<_>>()
            .into()
    }

    pub fn stats(&self) -> SimulatorStats {
        lock(&self.state).stats.clone()
    }

    /// behavior of monitors subsequently opened through [DatagramConnector::connect]
    pub fn set_behavior(&self, core: CoreLocation, behavior: SimulatorBehavior) {
        lock(&self.state).behaviors.insert(core, behavior);
    }

    /// makes all router / reinjection calls fail
    pub fn set_fail_monitor_calls(&self, fail: bool) {
        lock(&self.state).fail_monitor_calls = fail;
    }

    pub fn router_timeouts(&self) -> (RouterTimeout, RouterTimeout) {
        let state = lock(&self.state);
        (state.wait1, state.wait2)
    }

    pub fn reinjection_flags(&self) -> ReinjectionFlags {
        lock(&self.state).reinjection
    }

    /// `(timestamp, keys)` of the event messages a region received, in order
    pub fn events(&self, core: CoreLocation, region: u8) -> Vec<(u32, Vec<u32>)> {
        lock(&self.state).events.get(&(core, region)).cloned().unwrap_or_default()
    }

    pub fn is_event_stream_stopped(&self, core: CoreLocation, region: u8) -> bool {
        lock(&self.state).stopped_event_regions.contains(&(core, region))
    }

    /// A monitor core, reachable through the returned socket
    pub fn monitor(&self, core: CoreLocation, behavior: SimulatorBehavior) -> SimulatedMonitor {
        let (outbox, inbox) = mpsc::unbounded_channel();
        SimulatedMonitor {
            machine: self.clone(),
            core,
            outbox,
            inbox: tokio::sync::Mutex::new(inbox),
            state: Mutex::new(MonitorState {
                behavior,
                extract: None,
                assembler: HostReportAssembler::default(),
                inject: None,
                last_event_seq: FxHashMap::default(),
            }),
        }
    }

    fn monitor_call(&self, call: MonitorCall) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.stats.monitor_calls.push(call);
        if state.fail_monitor_calls {
            anyhow::bail!("simulated failure of {:?}", call);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceAccess for SimulatedMachine {
    async fn read_memory(&self, chip: ChipLocation, address: u32, length: u32) -> anyhow::Result<Bytes> {
        lock(&self.state).stats.direct_reads += 1;
        Ok(self.read(chip, address, length.safe_cast()))
    }

    async fn write_memory(&self, chip: ChipLocation, address: u32, data: &[u8]) -> anyhow::Result<()> {
        lock(&self.state).stats.direct_writes += 1;
        self.write(chip, address, data);
        Ok(())
    }

    async fn read_core_state(&self, core: CoreLocation) -> anyhow::Result<CoreState> {
        lock(&self.state).stats.core_state_reads += 1;
        Ok(CoreState {
            core,
            run_state: "RUNNING".to_string(),
            software_error_count: 0,
        })
    }
}

#[async_trait]
impl DatagramConnector for SimulatedMachine {
    async fn connect(&self, core: CoreLocation) -> anyhow::Result<Box<dyn DatagramSocket>> {
        let behavior = {
            let mut state = lock(&self.state);
            state.stats.connections += 1;
            state.behaviors.get(&core).cloned().unwrap_or_default()
        };
        Ok(Box::new(self.monitor(core, behavior)))
    }
}

#[async_trait]
impl ReinjectionControllable for SimulatedMachine {
    async fn set_router_timeout(&self, wait: RouterWait, timeout: RouterTimeout) -> anyhow::Result<()> {
        self.monitor_call(MonitorCall::SetRouterTimeout(wait, timeout))?;
        let mut state = lock(&self.state);
        match wait {
            RouterWait::Wait1 => state.wait1 = timeout,
            RouterWait::Wait2 => state.wait2 = timeout,
        }
        Ok(())
    }

    async fn set_reinjection(&self, flags: ReinjectionFlags) -> anyhow::Result<()> {
        self.monitor_call(MonitorCall::SetReinjection(flags))?;
        lock(&self.state).reinjection = flags;
        Ok(())
    }

    async fn clear_reinjection_queue(&self) -> anyhow::Result<()> {
        self.monitor_call(MonitorCall::ClearReinjectionQueue)
    }

    async fn install_application_routes(&self) -> anyhow::Result<()> {
        self.monitor_call(MonitorCall::InstallApplicationRoutes)
    }

    async fn install_system_routes(&self) -> anyhow::Result<()> {
        self.monitor_call(MonitorCall::InstallSystemRoutes)
    }

    async fn reinjection_status(&self) -> anyhow::Result<ReinjectionStatus> {
        self.monitor_call(MonitorCall::ReinjectionStatus)?;
        let state = lock(&self.state);
        Ok(ReinjectionStatus {
            wait1_timeout: state.wait1,
            wait2_timeout: state.wait2,
            n_dropped_packets: 0,
            n_missed_dropped_packets: 0,
            n_dropped_packet_overflows: 0,
            n_reinjected_packets: 0,
            n_link_dumps: 0,
            n_processor_dumps: 0,
            flags: state.reinjection,
            link_proc_bits: 0,
        })
    }
}

struct ExtractState {
    transaction_id: u32,
    address: u32,
    length: usize,
}

struct InjectState {
    transaction_id: u32,
    chip: ChipLocation,
    address: u32,
    max_sequence: u32,
    received: BitSet,
}

struct MonitorState {
    behavior: SimulatorBehavior,
    extract: Option<ExtractState>,
    assembler: HostReportAssembler,
    inject: Option<InjectState>,
    /// per region, the last event sequence number accepted
    last_event_seq: FxHashMap<u8, u8>,
}

/// The monitor side of a connection. Replies are produced synchronously while the host's
///  datagrams are sent, and queued for [DatagramSocket::recv].
pub struct SimulatedMonitor {
    machine: SimulatedMachine,
    core: CoreLocation,
    outbox: mpsc::UnboundedSender<Bytes>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    state: Mutex<MonitorState>,
}

impl SimulatedMonitor {
    fn reply(&self, datagram: Datagram) {
        let _ = self.outbox.send(datagram.into_bytes());
    }

    fn stream_chunks(&self, state: &mut MonitorState, sequences: &[u32]) {
        let (transaction_id, address, length) = match &state.extract {
            Some(e) => (e.transaction_id, e.address, e.length),
            None => return,
        };
        let codec = self.machine.codec;

        for (i, &seq) in sequences.iter().enumerate() {
            let is_last = i == sequences.len() - 1;
            let range = codec.chunk_range(seq, length);
            let data = self.machine.read(self.core.chip(), address + range.start as u32, range.len());
            let datagram = codec.encode_chunk(CommandId::SequencedData, transaction_id, seq, is_last, &data);

            if state.behavior.drop_once.remove(&seq) {
                trace!("simulator: dropping chunk {}", seq);
                continue;
            }
            if state.behavior.duplicate_all {
                self.reply(datagram.clone());
            }
            self.reply(datagram);
        }
    }

    fn on_start_extract(&self, state: &mut MonitorState, frame: &Frame) {
        let words = frame.words();
        state.extract = Some(ExtractState {
            transaction_id: frame.transaction_id,
            address: words[0],
            length: words[1].safe_cast(),
        });

        let codec = self.machine.codec;
        if state.behavior.stale_transaction_noise {
            self.reply(codec.encode_chunk(CommandId::SequencedData, frame.transaction_id.wrapping_add(1), 0, false, &[0xde, 0xad]));
        }
        if let Some(insane) = state.behavior.insane_sequence.take() {
            self.reply(codec.encode_chunk(CommandId::SequencedData, frame.transaction_id, insane, false, &[0; 4]));
        }

        let all = (0..codec.max_sequence(words[1].safe_cast())).collect::<Vec<_>>();
        self.stream_chunks(state, &all);
    }

    fn on_start_inject(&self, state: &mut MonitorState, frame: &Frame) {
        let words = frame.words();
        if state.inject.as_ref().map(|s| s.transaction_id) == Some(frame.transaction_id) {
            return;
        }
        state.inject = Some(InjectState {
            transaction_id: frame.transaction_id,
            chip: ChipLocation::from_packed(words[1]),
            address: words[0],
            max_sequence: words[2] + 1,
            received: BitSet::new(),
        });
    }

    fn on_inject_chunk(&self, state: &mut MonitorState, frame: &Frame) {
        let Some(sequence) = frame.sequence else { return; };
        if state.behavior.drop_once.remove(&sequence) {
            trace!("simulator: losing chunk {}", sequence);
            return;
        }
        let Some(inject) = &mut state.inject else { return; };
        if inject.transaction_id != frame.transaction_id || sequence >= inject.max_sequence {
            return;
        }
        let offset = self.machine.codec.chunk_offset(sequence) as u32;
        self.machine.write(inject.chip, inject.address + offset, &frame.payload);
        inject.received.insert(sequence.safe_cast());
    }

    fn on_tell(&self, state: &mut MonitorState, frame: &Frame) {
        let codec = self.machine.codec;
        let (missing, max_sequence) = match &state.inject {
            Some(inject) if inject.transaction_id == frame.transaction_id => {
                let missing = (0..inject.max_sequence)
                    .filter(|&s| !inject.received.contains(s.safe_cast()))
                    .collect::<Vec<_>>();
                (missing, inject.max_sequence)
            }
            _ => return,
        };

        let replies = if let Some(insane) = state.behavior.insane_sequence.take() {
            vec![codec.encode_control(CommandId::ReceiveMissingSeqData, frame.transaction_id, &[insane, MISSING_SEQ_END_FLAG])]
        }
        else if missing.is_empty() {
            vec![codec.encode_control(CommandId::ReceiveFinished, frame.transaction_id, &[])]
        }
        else {
            encode_device_missing_report(&codec, frame.transaction_id, &missing, max_sequence)
        };

        if state.behavior.drop_replies > 0 {
            state.behavior.drop_replies -= 1;
            trace!("simulator: losing reply");
            return;
        }
        for reply in replies {
            self.reply(reply);
        }
    }

    /// Events are accepted strictly in order. Every event is answered with the region's last
    ///  accepted sequence number, so a gap shows up as a repeated acknowledgement.
    fn on_event(&self, state: &mut MonitorState, frame: &Frame) {
        let Some(event) = SequencedEvent::parse(frame) else { return; };
        if state.behavior.drop_once.remove(&(event.seq as u32)) {
            trace!("simulator: losing event {}", event.seq);
            return;
        }

        let last = state.last_event_seq.entry(event.region).or_insert(u8::MAX);
        if event.seq == last.wrapping_add(1) {
            *last = event.seq;
            let mut machine = lock(&self.machine.state);
            machine.stats.events_accepted += 1;
            let key = (self.core, event.region);
            match event.payload {
                Some(payload) => machine.events.entry(key).or_default().push(payload),
                None => { machine.stopped_event_regions.insert(key); }
            }
        }

        let request = BufferRequest {
            region: event.region,
            last_received_seq: *last,
            space_available: SIMULATED_EVENT_SPACE,
        };
        self.reply(encode_buffer_request(&self.machine.codec, frame.transaction_id, request));
    }

    fn on_datagram(&self, datagram: &[u8]) {
        let Ok(frame) = self.machine.codec.decode(datagram) else { return; };
        let mut state = lock(&self.state);

        {
            let mut machine = lock(&self.machine.state);
            match frame.command {
                CommandId::StartSending | CommandId::SendDataToLocation => machine.stats.starts += 1,
                CommandId::Clear => machine.stats.clears += 1,
                CommandId::SendSeqData => machine.stats.data_packets_received += 1,
                _ => {}
            }
        }

        if state.behavior.silent {
            return;
        }

        match frame.command {
            CommandId::StartSending | CommandId::SendDataToLocation if state.behavior.ignore_starts > 0 => {
                state.behavior.ignore_starts -= 1;
            }
            CommandId::StartSending => self.on_start_extract(&mut state, &frame),
            CommandId::StartMissingSeq | CommandId::MissingSeq => {
                if let Some(missing) = state.assembler.absorb(&frame) {
                    {
                        let mut machine = lock(&self.machine.state);
                        machine.stats.missing_reports += 1;
                        machine.stats.requested_missing.push(missing.clone());
                    }
                    self.stream_chunks(&mut state, &missing);
                }
            }
            CommandId::Clear => state.extract = None,
            CommandId::SendDataToLocation => self.on_start_inject(&mut state, &frame),
            CommandId::SendSeqData => self.on_inject_chunk(&mut state, &frame),
            CommandId::SendTell => self.on_tell(&mut state, &frame),
            CommandId::HostSendSequenced | CommandId::EventStop => self.on_event(&mut state, &frame),
            _ => {}
        }
    }
}

#[async_trait]
impl DatagramSocket for SimulatedMonitor {
    async fn send(&self, datagram: &[u8]) -> std::io::Result<()> {
        self.on_datagram(datagram);
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<Bytes> {
        match self.inbox.lock().await.recv().await {
            Some(datagram) => Ok(datagram),
            None => std::future::pending().await,
        }
    }
}
