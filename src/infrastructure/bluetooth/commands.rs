//! Command Reliability Queue
//!
//! The controller acknowledges nothing at the transport level. Every
//! subcommand carries a sequence number and the firmware echoes it in a
//! reply frame; this queue matches the two and retries on silence.
//!
//! ```text
//! send ──► gate (one in flight, min spacing) ──► write ──► wait for reply
//!                ▲                                  │          │
//!                └────────── retry (new sequence) ◄─┴─ timeout ┘
//! ```

use crate::domain::mapper::FactoryStickBlock;
use crate::domain::models::EndpointId;
use crate::infrastructure::bluetooth::protocol::{
    self, build_rumble_frame, build_subcommand_frame, parse_reply, subcommand, CommandReply,
    DecodeError, RumbleData,
};
use crate::infrastructure::bluetooth::transport::FrameWriter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no reply after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("command queue cancelled")]
    Cancelled,
    #[error("controller rejected subcommand {subcommand:#04x}")]
    Rejected { subcommand: u8 },
    #[error("transport write failed")]
    WriteFailed,
    #[error("malformed reply: {0}")]
    Malformed(#[from] DecodeError),
}

/// Timing rules for the send gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTiming {
    /// Minimum gap between any two writes
    pub min_spacing: Duration,
    pub ack_timeout: Duration,
    /// Retries after the first attempt
    pub retry_limit: u32,
}

impl Default for QueueTiming {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(250),
            retry_limit: 3,
        }
    }
}

impl QueueTiming {
    /// Total writes allowed for one command
    pub fn attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }
}

/// One logical command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub endpoint: EndpointId,
    pub subcommand: u8,
    pub args: Vec<u8>,
}

impl CommandRequest {
    pub fn new(endpoint: EndpointId, subcommand: u8, args: impl Into<Vec<u8>>) -> Self {
        Self {
            endpoint,
            subcommand,
            args: args.into(),
        }
    }
}

struct Pending {
    subcommand: u8,
    reply: oneshot::Sender<CommandReply>,
}

/// Owned rolling counters plus the timestamp of the last write
#[derive(Debug, Default)]
struct Gate {
    last_send: Option<Instant>,
    sequence: u8,
    nibble: u8,
}

impl Gate {
    fn next_sequence(&mut self) -> u8 {
        let current = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        current
    }

    fn next_nibble(&mut self) -> u8 {
        let current = self.nibble;
        self.nibble = (self.nibble + 1) & 0x0F;
        current
    }
}

pub struct CommandQueue {
    writer: Arc<dyn FrameWriter>,
    timing: QueueTiming,
    gate: tokio::sync::Mutex<Gate>,
    pending: Mutex<HashMap<u8, Pending>>,
    token: Mutex<CancellationToken>,
}

impl CommandQueue {
    pub fn new(writer: Arc<dyn FrameWriter>, timing: QueueTiming) -> Self {
        Self {
            writer,
            timing,
            gate: tokio::sync::Mutex::new(Gate::default()),
            pending: Mutex::new(HashMap::new()),
            token: Mutex::new(CancellationToken::new()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u8, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of commands waiting for a reply
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Send one command and wait for its reply.
    ///
    /// A reply is returned whether or not the firmware accepted the command.
    pub async fn send(&self, request: CommandRequest) -> Result<CommandReply, CommandError> {
        let token = self.current_token();
        let mut gate = tokio::select! {
            _ = token.cancelled() => return Err(CommandError::Cancelled),
            gate = self.gate.lock() => gate,
        };

        let attempts = self.timing.attempts();
        for attempt in 1..=attempts {
            self.wait_for_spacing(&gate, &token).await?;

            let sequence = gate.next_sequence();
            let nibble = gate.next_nibble();
            let frame =
                build_subcommand_frame(nibble, sequence, request.subcommand, &request.args);

            let (tx, rx) = oneshot::channel();
            self.lock_pending().insert(
                sequence,
                Pending {
                    subcommand: request.subcommand,
                    reply: tx,
                },
            );

            trace!(
                "Sending subcommand {:#04x} seq {} to {} (attempt {}/{})",
                request.subcommand,
                sequence,
                request.endpoint,
                attempt,
                attempts
            );
            let written = self.writer.write(&request.endpoint, &frame);
            gate.last_send = Some(Instant::now());

            if !written {
                self.lock_pending().remove(&sequence);
                warn!(
                    "Write of subcommand {:#04x} to {} failed (attempt {}/{})",
                    request.subcommand, request.endpoint, attempt, attempts
                );
                continue;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    self.lock_pending().remove(&sequence);
                    return Err(CommandError::Cancelled);
                }
                result = tokio::time::timeout(self.timing.ack_timeout, rx) => match result {
                    Ok(Ok(reply)) => {
                        debug!(
                            "Subcommand {:#04x} seq {} acknowledged (accepted: {})",
                            request.subcommand, sequence, reply.accepted
                        );
                        return Ok(reply);
                    }
                    // Sender dropped: the pending table was drained by a cancel.
                    Ok(Err(_)) => return Err(CommandError::Cancelled),
                    Err(_) => {
                        self.lock_pending().remove(&sequence);
                        debug!(
                            "Subcommand {:#04x} seq {} timed out (attempt {}/{})",
                            request.subcommand, sequence, attempt, attempts
                        );
                    }
                }
            }
        }

        warn!(
            "Subcommand {:#04x} to {} failed after {} attempts",
            request.subcommand, request.endpoint, attempts
        );
        Err(CommandError::Exhausted { attempts })
    }

    /// Write a frame that expects no reply, still honouring the send gate
    pub async fn send_unacknowledged(
        &self,
        endpoint: &EndpointId,
        rumble: RumbleData,
    ) -> Result<(), CommandError> {
        let token = self.current_token();
        let mut gate = tokio::select! {
            _ = token.cancelled() => return Err(CommandError::Cancelled),
            gate = self.gate.lock() => gate,
        };
        self.wait_for_spacing(&gate, &token).await?;

        let frame = build_rumble_frame(gate.next_nibble(), rumble);
        let written = self.writer.write(endpoint, &frame);
        gate.last_send = Some(Instant::now());
        if written {
            Ok(())
        } else {
            Err(CommandError::WriteFailed)
        }
    }

    pub async fn keep_alive(&self, endpoint: &EndpointId) -> Result<(), CommandError> {
        self.send_unacknowledged(endpoint, RumbleData::NEUTRAL).await
    }

    async fn wait_for_spacing(
        &self,
        gate: &Gate,
        token: &CancellationToken,
    ) -> Result<(), CommandError> {
        let Some(last) = gate.last_send else {
            return Ok(());
        };
        tokio::select! {
            _ = token.cancelled() => Err(CommandError::Cancelled),
            _ = tokio::time::sleep_until(last + self.timing.min_spacing) => Ok(()),
        }
    }

    /// Match a reply frame to the command waiting for it.
    ///
    /// Returns false for replies nobody is waiting for; those are dropped.
    pub fn handle_reply(&self, bytes: &[u8]) -> bool {
        let reply = match parse_reply(bytes) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Ignoring malformed reply: {}", e);
                return false;
            }
        };

        let Some(pending) = self.lock_pending().remove(&reply.sequence) else {
            debug!("Discarding unmatched reply for seq {}", reply.sequence);
            return false;
        };
        if pending.subcommand != reply.subcommand {
            debug!(
                "Reply seq {} echoes subcommand {:#04x}, expected {:#04x}",
                reply.sequence, reply.subcommand, pending.subcommand
            );
        }
        // The waiter may have just given up; nothing to do then.
        let _ = pending.reply.send(reply);
        true
    }

    /// Abort every waiting command and start over with a fresh token
    pub fn cancel(&self) {
        let previous = {
            let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        previous.cancel();
        let drained = self.lock_pending().drain().count();
        info!("Command queue cancelled ({} pending dropped)", drained);
    }

    /// Light the player indicator for player 1-4
    pub async fn set_player_indicator(
        &self,
        endpoint: &EndpointId,
        player: u8,
    ) -> Result<(), CommandError> {
        let pattern = protocol::player_indicator_pattern(player);
        let request = CommandRequest::new(
            endpoint.clone(),
            subcommand::SET_PLAYER_INDICATOR,
            vec![pattern],
        );
        let reply = self.send(request).await?;
        if !reply.accepted {
            return Err(CommandError::Rejected {
                subcommand: reply.subcommand,
            });
        }
        Ok(())
    }

    /// Read and decode the factory stick calibration block
    pub async fn read_stick_calibration(
        &self,
        endpoint: &EndpointId,
    ) -> Result<FactoryStickBlock, CommandError> {
        let args = protocol::flash_read_args(
            protocol::FACTORY_STICK_CALIBRATION_ADDR,
            protocol::FACTORY_STICK_CALIBRATION_LEN,
        );
        let request = CommandRequest::new(endpoint.clone(), subcommand::FLASH_READ, args);
        let reply = self.send(request).await?;
        if !reply.accepted {
            return Err(CommandError::Rejected {
                subcommand: reply.subcommand,
            });
        }
        let block = protocol::decode_factory_stick_block(protocol::flash_read_payload(&reply.data))?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{
        build_reply_frame, frame_sequence, pack_stick_pair,
    };
    use tokio::sync::mpsc;

    /// Records writes and optionally forwards them to a fake firmware
    struct RecordingWriter {
        writes: Mutex<Vec<(Instant, Vec<u8>)>>,
        forward: Option<mpsc::UnboundedSender<Vec<u8>>>,
        succeed: bool,
    }

    impl RecordingWriter {
        fn silent() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                forward: None,
                succeed: true,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                forward: None,
                succeed: false,
            })
        }

        fn forwarding() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let writer = Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                forward: Some(tx),
                succeed: true,
            });
            (writer, rx)
        }

        fn frames(&self) -> Vec<(Instant, Vec<u8>)> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl FrameWriter for RecordingWriter {
        fn write(&self, _endpoint: &EndpointId, bytes: &[u8]) -> bool {
            self.writes
                .lock()
                .unwrap()
                .push((Instant::now(), bytes.to_vec()));
            if let Some(forward) = &self.forward {
                let _ = forward.send(bytes.to_vec());
            }
            self.succeed
        }
    }

    /// Answers every subcommand frame with an accepted reply carrying `data`
    fn spawn_firmware(
        queue: Arc<CommandQueue>,
        mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
        data: Vec<u8>,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Some((sub, seq)) = frame_sequence(&frame) {
                    queue.handle_reply(&build_reply_frame(seq, true, sub, &data));
                }
            }
        });
    }

    fn endpoint() -> EndpointId {
        EndpointId::from("joycon-l")
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_command_resolves() {
        let (writer, frames) = RecordingWriter::forwarding();
        let queue = Arc::new(CommandQueue::new(writer.clone(), QueueTiming::default()));
        spawn_firmware(queue.clone(), frames, vec![]);

        queue.set_player_indicator(&endpoint(), 2).await.unwrap();

        let writes = writer.frames();
        assert_eq!(writes.len(), 1);
        assert_eq!(frame_sequence(&writes[0].1), Some((subcommand::SET_PLAYER_INDICATOR, 0)));
        assert_eq!(writes[0].1[12], 0b0011);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_firmware_exhausts_retries() {
        let writer = RecordingWriter::silent();
        let timing = QueueTiming::default();
        let queue = CommandQueue::new(writer.clone(), timing);

        let result = queue
            .send(CommandRequest::new(endpoint(), subcommand::FLASH_READ, vec![]))
            .await;

        assert!(matches!(
            result,
            Err(CommandError::Exhausted { attempts }) if attempts == timing.retry_limit + 1
        ));
        let sequences: Vec<u8> = writer
            .frames()
            .iter()
            .filter_map(|(_, f)| frame_sequence(f).map(|(_, seq)| seq))
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_limit_still_sends() {
        let timing = QueueTiming {
            retry_limit: u32::MAX,
            ..QueueTiming::default()
        };
        assert_eq!(timing.attempts(), u32::MAX);

        let (writer, frames) = RecordingWriter::forwarding();
        let queue = Arc::new(CommandQueue::new(writer.clone(), timing));
        spawn_firmware(queue.clone(), frames, vec![]);

        let reply = queue
            .send(CommandRequest::new(endpoint(), subcommand::SET_PLAYER_INDICATOR, vec![1]))
            .await
            .unwrap();
        assert!(reply.accepted);
        assert_eq!(writer.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_skips_ack_wait() {
        let writer = RecordingWriter::failing();
        let timing = QueueTiming::default();
        let queue = CommandQueue::new(writer.clone(), timing);

        let start = Instant::now();
        let result = queue
            .send(CommandRequest::new(endpoint(), subcommand::FLASH_READ, vec![]))
            .await;

        assert!(matches!(result, Err(CommandError::Exhausted { attempts: 4 })));
        assert_eq!(writer.frames().len(), 4);
        // Only the spacing between the four writes elapsed.
        assert_eq!(start.elapsed(), timing.min_spacing * 3);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_respect_min_spacing() {
        let (writer, frames) = RecordingWriter::forwarding();
        let timing = QueueTiming::default();
        let queue = Arc::new(CommandQueue::new(writer.clone(), timing));
        spawn_firmware(queue.clone(), frames, vec![]);

        queue.set_player_indicator(&endpoint(), 1).await.unwrap();
        queue.keep_alive(&endpoint()).await.unwrap();
        queue.set_player_indicator(&endpoint(), 3).await.unwrap();

        let writes = writer.frames();
        assert_eq!(writes.len(), 3);
        for pair in writes.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= timing.min_spacing);
        }
        // Sub-sequence nibble rolls across every frame type.
        assert_eq!(writes[0].1[1], 0);
        assert_eq!(writes[1].1[1], 1);
        assert_eq!(writes[2].1[1], 2);
        assert_eq!(writes[1].1[0], protocol::FRAME_RUMBLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_command_in_flight() {
        let writer = RecordingWriter::silent();
        let timing = QueueTiming {
            retry_limit: 0,
            ..QueueTiming::default()
        };
        let queue = Arc::new(CommandQueue::new(writer.clone(), timing));

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .send(CommandRequest::new(endpoint(), subcommand::FLASH_READ, vec![]))
                    .await
            })
        };
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .send(CommandRequest::new(endpoint(), subcommand::FLASH_READ, vec![]))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(writer.frames().len(), 1);
        assert!(queue.pending_len() <= 1);

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        let writes = writer.frames();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].0 - writes[0].0 >= timing.ack_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_reply_is_discarded() {
        let queue = CommandQueue::new(RecordingWriter::silent(), QueueTiming::default());
        assert!(!queue.handle_reply(&build_reply_frame(9, true, 0x30, &[])));
        assert!(!queue.handle_reply(&[protocol::COMMAND_REPLY_MARKER]));
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_wait_and_queue_recovers() {
        let (writer, mut frames) = RecordingWriter::forwarding();
        let queue = Arc::new(CommandQueue::new(writer.clone(), QueueTiming::default()));

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .send(CommandRequest::new(endpoint(), subcommand::FLASH_READ, vec![]))
                    .await
            })
        };
        // Wait until the frame is on the wire, then pull the plug.
        frames.recv().await.unwrap();
        queue.cancel();
        assert!(matches!(waiting.await.unwrap(), Err(CommandError::Cancelled)));
        assert_eq!(queue.pending_len(), 0);

        spawn_firmware(queue.clone(), frames, vec![]);
        queue.set_player_indicator(&endpoint(), 1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_reports_error() {
        let (writer, mut frames) = RecordingWriter::forwarding();
        let queue = Arc::new(CommandQueue::new(writer, QueueTiming::default()));
        {
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    if let Some((sub, seq)) = frame_sequence(&frame) {
                        queue.handle_reply(&build_reply_frame(seq, false, sub, &[]));
                    }
                }
            });
        }
        let result = queue.set_player_indicator(&endpoint(), 1).await;
        assert!(matches!(
            result,
            Err(CommandError::Rejected { subcommand: 0x30 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_stick_calibration() {
        let (writer, frames) = RecordingWriter::forwarding();
        let queue = Arc::new(CommandQueue::new(writer, QueueTiming::default()));

        let mut data = protocol::flash_read_args(0x603D, 18).to_vec();
        for (a, b) in [
            (1251, 1251),
            (1998, 1998),
            (1252, 1252),
            (2000, 2001),
            (1240, 1241),
            (1260, 1261),
        ] {
            data.extend(pack_stick_pair(a, b));
        }
        spawn_firmware(queue.clone(), frames, data);

        let block = queue.read_stick_calibration(&endpoint()).await.unwrap();
        assert_eq!(block.left.center, (1998, 1998));
        assert_eq!(block.right.center, (2000, 2001));
        assert_eq!(block.right.above, (1260, 1261));
    }

    #[test]
    fn test_counters_wrap() {
        let mut gate = Gate {
            sequence: 255,
            nibble: 15,
            ..Gate::default()
        };
        assert_eq!(gate.next_sequence(), 255);
        assert_eq!(gate.next_sequence(), 0);
        assert_eq!(gate.next_nibble(), 15);
        assert_eq!(gate.next_nibble(), 0);
    }
}
