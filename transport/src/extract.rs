use bytes::Bytes;
use tracing::{debug, trace};
use crate::commands::{CommandId, TransferDirection};
use crate::core_location::CoreLocation;
use crate::error::{TransferError, TransferResult};
use crate::frame::Frame;
use crate::missing_report::encode_host_missing_report;
use crate::retry::{await_reply, WaitOutcome};
use crate::session::{SessionState, TransferContext, TransferSession, TransferStats};

/// Streams `length` bytes starting at `address` from the memory of `core`'s chip to the host.
///
/// The host is the receiving side: the monitor streams all chunks and flags the last one of
///  each round, the host replies with the sequence numbers it is missing, and the monitor
///  re-sends those. When a receive times out the host repeats its last request: the start
///  packet if no data has arrived yet, a missing report otherwise.
pub async fn extract(ctx: &TransferContext<'_>, core: CoreLocation, address: u32, length: u32, transaction_id: u32) -> TransferResult<(Bytes, TransferStats)> {
    let mut session = TransferSession::new_extract(core, address, length, transaction_id, ctx.codec());
    let codec = *session.codec();
    let mut retry = ctx.retry_state();
    let mut received_any = false;

    debug!("extracting {} bytes at {:#010x} from {} in {} chunks", length, address, core, session.max_sequence());

    let start = codec.encode_start(TransferDirection::Extract, transaction_id, address, length, core.chip());
    session.start(ctx.clock.now());
    ctx.send(&start).await?;
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

                if received_any {
                    debug!("timeout #{} waiting for data, requesting missing chunks", retry.timeouts());
                    request_missing(ctx, &mut session).await?;
                }
                else {
                    debug!("timeout #{} waiting for the first chunk, re-sending start", retry.timeouts());
                    ctx.send(&start).await?;
                }
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

        let end_of_round = match frame {
            Frame { command: CommandId::SequencedData, sequence: Some(sequence), is_end, ref payload, .. } => {
                retry.reset();
                received_any = true;
                match session.record_chunk(sequence, payload) {
                    Ok(_) => {}
                    Err(e @ TransferError::MalformedFrame(_)) => debug!("dropping chunk: {}", e),
                    Err(e) => {
                        session.fail();
                        return Err(e);
                    }
                }
                is_end
            }
            Frame { command: CommandId::EndOfStream, .. } => {
                retry.reset();
                true
            }
            _ => {
                debug!("ignoring unexpected {:?} during extraction", frame.command);
                false
            }
        };

        if session.is_complete() {
            ctx.send(&codec.encode_control(CommandId::Clear, transaction_id, &[])).await?;
            return Ok(session.finish(ctx.clock.now()));
        }
        if end_of_round && received_any {
            request_missing(ctx, &mut session).await?;
        }
    }
}

async fn request_missing(ctx: &TransferContext<'_>, session: &mut TransferSession) -> TransferResult<()> {
    let missing = session.missing();
    session.record_round(missing.len(), ctx.config.minor_loss_threshold);
    session.transition(SessionState::Retransmitting);

    let report = encode_host_missing_report(session.codec(), session.transaction_id, &missing);
    ctx.send_throttled(&report, ctx.config.missing_report_delay).await?;

    session.transition(SessionState::AwaitingReply);
    Ok(())
}
