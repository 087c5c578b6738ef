use tracing::{debug, trace};
use crate::commands::{CommandId, TransferDirection};
use crate::core_location::CoreLocation;
use crate::error::TransferResult;
use crate::missing_report::{DeviceReportCollector, ReportProgress};
use crate::retry::{await_reply, WaitOutcome};
use crate::session::{SessionState, TransferContext, TransferSession, TransferStats};

/// Streams `data` into the memory of `core`'s chip at `address`.
///
/// The monitor is the receiving side. After the host's end flag it replies either with
///  'finished' or with a report of the missing sequence numbers, possibly spread over several
///  packets. The host re-sends the reported chunks followed by a fresh end flag until the monitor
///  is satisfied.
pub async fn inject(ctx: &TransferContext<'_>, core: CoreLocation, address: u32, data: &[u8], transaction_id: u32) -> TransferResult<TransferStats> {
    let mut session = TransferSession::new_inject(core, address, data, transaction_id, ctx.codec());
    let mut retry = ctx.retry_state();
    let mut collector = DeviceReportCollector::default();
    let mut last_missing: Option<Vec<u32>> = None;

    debug!("injecting {} bytes at {:#010x} on {} in {} chunks", data.len(), address, core, session.max_sequence());

    session.start(ctx.clock.now());
    send_everything(ctx, &mut session).await?;
    session.transition(SessionState::AwaitingReply);

    loop {
        let raw = match await_reply(ctx.clock, ctx.cancel, retry.current_timeout(), ctx.socket.recv()).await {
            WaitOutcome::Ready(raw) => raw?,
            WaitOutcome::Cancelled => {
                session.fail();
                return Err(session.cancelled_error());
            }
            WaitOutcome::TimedOut => {
                if !retry.on_timeout() {
                    session.fail();
                    ctx.log_core_diagnostics(core).await;
                    return Err(session.timeout_error(retry.timeouts()));
                }

                // a partially received report is useless, the monitor repeats it after the next end flag
                collector = DeviceReportCollector::default();
                session.transition(SessionState::Retransmitting);
                match &last_missing {
                    None => {
                        debug!("timeout #{} without a report, re-sending everything", retry.timeouts());
                        send_everything(ctx, &mut session).await?;
                    }
                    Some(missing) => {
                        debug!("timeout #{} after a report, re-sending {} chunks", retry.timeouts(), missing.len());
                        send_chunks(ctx, &mut session, missing).await?;
                    }
                }
                session.transition(SessionState::AwaitingReply);
                continue;
            }
        };

        let frame = match session.codec().decode(&raw) {
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

        match frame.command {
            CommandId::ReceiveMissingSeqData => {
                retry.reset();
                match collector.absorb(&frame.words(), session.max_sequence()) {
                    Err(sequence) => {
                        session.fail();
                        return Err(session.insane_sequence_error(sequence));
                    }
                    Ok(ReportProgress::Partial) => {}
                    Ok(ReportProgress::Complete) => {
                        let missing = collector.take(session.max_sequence());
                        session.confirm_all_except(&missing)?;
                        session.record_round(missing.len(), ctx.config.minor_loss_threshold);

                        session.transition(SessionState::Retransmitting);
                        send_chunks(ctx, &mut session, &missing).await?;
                        session.transition(SessionState::AwaitingReply);
                        last_missing = Some(missing);
                    }
                }
            }
            CommandId::ReceiveFinished => {
                session.confirm_all_except(&[])?;
                let (_, stats) = session.finish(ctx.clock.now());
                return Ok(stats);
            }
            other => debug!("ignoring unexpected {:?} during injection", other),
        }
    }
}

async fn send_everything(ctx: &TransferContext<'_>, session: &mut TransferSession) -> TransferResult<()> {
    let start = session.codec().encode_start(TransferDirection::Inject, session.transaction_id, session.address, session.length, session.target_core.chip());
    ctx.send(&start).await?;

    let all = (0..session.max_sequence()).collect::<Vec<_>>();
    send_chunks(ctx, session, &all).await
}

/// sends the given chunks, throttled, followed by the end flag
async fn send_chunks(ctx: &TransferContext<'_>, session: &mut TransferSession, sequences: &[u32]) -> TransferResult<()> {
    let codec = *session.codec();
    let command = CommandId::data_command(TransferDirection::Inject);

    for &seq in sequences {
        ctx.clock.sleep(ctx.config.send_delay).await;
        let datagram = codec.encode_chunk(command, session.transaction_id, seq, false, session.chunk(seq));
        ctx.send(&datagram).await?;
        session.count_sent_chunk();
    }

    ctx.send(&codec.encode_end_flag(TransferDirection::Inject, session.transaction_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio_util::sync::CancellationToken;
    use crate::clock::TokioClock;
    use crate::config::TransferConfig;
    use crate::datagram_socket::MockDatagramSocket;
    use crate::error::TransferError;
    use crate::test_util::{random_bytes, SimulatedMachine, SimulatorBehavior};

    const BASE: u32 = 0x7000_0000;

    fn core() -> CoreLocation {
        CoreLocation::new(1, 2, 5)
    }

    fn run_inject(config: TransferConfig, data: &[u8], behavior: SimulatorBehavior) -> (SimulatedMachine, TransferResult<TransferStats>) {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let machine = SimulatedMachine::new(config.datagram_capacity);
            let socket = machine.monitor(core(), behavior);
            let cancel = CancellationToken::new();
            let ctx = TransferContext {
                config: &config,
                socket: &socket,
                device: &machine,
                clock: &TokioClock,
                cancel: &cancel,
            };
            let result = inject(&ctx, core(), BASE, data, 9).await;
            (machine, result)
        })
    }

    fn written(machine: &SimulatedMachine, len: usize) -> Bytes {
        machine.read(core().chip(), BASE, len)
    }

    #[rstest]
    #[case::one(1)]
    #[case::chunk_minus_one(259)]
    #[case::chunk(260)]
    #[case::chunk_plus_one(261)]
    #[case::ten_chunks_plus_seven(2607)]
    fn test_lengths(#[case] length: usize) {
        let data = random_bytes(length);
        let (machine, result) = run_inject(TransferConfig::default_spinnaker(), &data, SimulatorBehavior::default());
        let stats = result.unwrap();
        assert_eq!(stats.rounds(), 0);
        assert_eq!(written(&machine, length).as_ref(), data.as_slice());
    }

    #[test]
    fn test_dropped_chunks() {
        let data = random_bytes(20_000);
        let behavior = SimulatorBehavior {
            drop_once: [0, 5, 50, 76].into_iter().collect(),
            ..SimulatorBehavior::default()
        };
        let (machine, result) = run_inject(TransferConfig::default_spinnaker(), &data, behavior);
        let stats = result.unwrap();
        assert_eq!(stats.lost_per_round, vec![4]);
        assert_eq!(written(&machine, data.len()).as_ref(), data.as_slice());
    }

    #[test]
    fn test_long_missing_report() {
        // 150 missing chunks need a report spread over three packets
        let data = random_bytes(300 * 260);
        let behavior = SimulatorBehavior {
            drop_once: (0..300).filter(|s| s % 2 == 0).collect(),
            ..SimulatorBehavior::default()
        };
        let (machine, result) = run_inject(TransferConfig::default_spinnaker(), &data, behavior);
        let stats = result.unwrap();
        assert_eq!(stats.lost_per_round, vec![150]);
        assert_eq!(written(&machine, data.len()).as_ref(), data.as_slice());
    }

    #[test]
    fn test_everything_missing() {
        let data = random_bytes(2000);
        let behavior = SimulatorBehavior {
            drop_once: (0..8).collect(),
            ..SimulatorBehavior::default()
        };
        let (machine, result) = run_inject(TransferConfig::default_spinnaker(), &data, behavior);
        assert_eq!(result.unwrap().lost_per_round, vec![8]);
        assert_eq!(written(&machine, data.len()).as_ref(), data.as_slice());
    }

    #[test]
    fn test_lost_report_is_recovered() {
        let data = random_bytes(5000);
        let behavior = SimulatorBehavior {
            drop_once: [4].into_iter().collect(),
            drop_replies: 1,
            ..SimulatorBehavior::default()
        };
        let (machine, result) = run_inject(TransferConfig::default_spinnaker(), &data, behavior);
        let stats = result.unwrap();
        // without a report, the timeout re-sends everything, which fills the gap
        assert_eq!(stats.rounds(), 0);
        assert_eq!(machine.stats().starts, 2);
        assert_eq!(written(&machine, data.len()).as_ref(), data.as_slice());
    }

    #[test]
    fn test_timeout() {
        let mut config = TransferConfig::default_spinnaker();
        config.timeout_retry_limit = 3;
        let (machine, result) = run_inject(config, &random_bytes(1000), SimulatorBehavior { silent: true, ..SimulatorBehavior::default() });
        assert!(matches!(result, Err(TransferError::TransferTimeout { attempts: 4, length: 1000, address: BASE, .. })));
        assert_eq!(machine.stats().core_state_reads, 1);
        // initial send plus one complete resend per timeout that did not end the session
        assert_eq!(machine.stats().starts, 4);
    }

    #[test]
    fn test_insane_report() {
        let behavior = SimulatorBehavior {
            insane_sequence: Some(1000),
            ..SimulatorBehavior::default()
        };
        let (_, result) = run_inject(TransferConfig::default_spinnaker(), &random_bytes(1000), behavior);
        assert!(matches!(result, Err(TransferError::InsaneSequenceNumber { sequence: 1000, max_sequence: 4, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_error_ends_session() {
        let config = TransferConfig::default_spinnaker();
        let machine = SimulatedMachine::new(config.datagram_capacity);
        let mut socket = MockDatagramSocket::new();
        socket.expect_send()
            .times(1)
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe")));
        socket.expect_recv()
            .never();
        let cancel = CancellationToken::new();
        let ctx = TransferContext {
            config: &config,
            socket: &socket,
            device: &machine,
            clock: &TokioClock,
            cancel: &cancel,
        };

        let result = inject(&ctx, core(), BASE, &random_bytes(1000), 1).await;
        assert!(matches!(result, Err(TransferError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe));
        assert!(machine.read(core().chip(), BASE, 1000).iter().all(|&b| b == 0));
    }
}
