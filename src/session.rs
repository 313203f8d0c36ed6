// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Firmware programming session.
//!
//! The radio bootloader is driven with single-byte answers:
//!  - `0x00` while it is still starting up,
//!  - `0x06` (ACK) to accept the previous command or block,
//!  - `0xFF` (NAK) to reject it.
//!
//! A session sends the connect sequence until the radio answers, repeats it for three ACK'd
//! round-trips, sends the update sequence and then streams the image in 1024-byte blocks, one
//! outstanding block at a time. After the last block is acknowledged the end sequence is sent.
//!
//! [ProgrammingSession] is a plain state machine: it is fed bytes and clock ticks and answers
//! with [Action]s. [program] runs it against a [Transport], with a reader thread forwarding
//! received bytes over a channel so that all state changes happen on the calling thread.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::{fmt, io};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::image::MemoryImage;
use crate::packet;
use crate::transport::Transport;
use crate::variant::{ProtocolVariant, ACK, BLOCK_SIZE, NAK, PRESENCE};

/// Timing and retry limits of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time to wait for a first answer before sending the connect sequence again.
    pub connect_interval: Duration,
    /// Connect sequences sent before giving up on a silent radio.
    pub connect_attempts: u32,
    /// Turnaround after a connect or update sequence.
    pub command_delay: Duration,
    /// Turnaround after the end sequence, before the port is closed.
    pub end_delay: Duration,
    /// Time to wait for a block ACK before resending it.
    pub ack_timeout: Duration,
    /// Time to wait for a handshake ACK before giving up.
    pub handshake_timeout: Duration,
    /// Resends of a single block before the session is aborted.
    pub max_retries: u32,
    /// How often the clock is checked while no bytes arrive.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_interval: Duration::from_millis(200),
            connect_attempts: 4,
            command_delay: Duration::from_millis(50),
            end_delay: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            max_retries: 3,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Why a session stopped early.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    NoResponse,
    NakDuringHandshake { stage: &'static str },
    HandshakeTimeout { stage: &'static str },
    MaxRetriesExceeded { offset: u32, attempts: u32 },
}

impl From<AbortReason> for Error {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::NoResponse => Error::NoResponse,
            AbortReason::NakDuringHandshake { stage } => Error::NakDuringHandshake { stage },
            AbortReason::HandshakeTimeout { stage } => Error::HandshakeTimeout { stage },
            AbortReason::MaxRetriesExceeded { offset, attempts } => {
                Error::MaxRetriesExceeded { offset, attempts }
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Connect sequence sent, waiting for the first ACK.
    Connecting { attempts: u32 },
    /// Connect sequence repeated, `step` ACKs so far plus one.
    Handshaking { step: u8 },
    UpdateSent,
    /// Streaming blocks. `cursor` is the offset of the next block to send.
    Transferring { cursor: usize },
    Completed,
    Aborted(AbortReason),
}

impl SessionState {
    fn stage(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting { .. } => "connect",
            Self::Handshaking { .. } => "handshake",
            Self::UpdateSent => "update",
            Self::Transferring { .. } => "transfer",
            Self::Completed => "completed",
            Self::Aborted(_) => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stage())
    }
}

/// A data block has been sent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    /// 1-based number of the block just sent.
    pub block: usize,
    pub total: usize,
    /// Image offset of the block just sent.
    pub offset: u32,
    pub retransmission: bool,
}

/// What the session wants done next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Send(Vec<u8>),
    /// Let the bootloader turn around before anything else is sent.
    Pause(Duration),
    Progress(Progress),
}

/// Outcome of a completed session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub blocks: usize,
    pub retransmissions: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// The handshake and block transfer state machine.
pub struct ProgrammingSession {
    variant: ProtocolVariant,
    image: MemoryImage,
    config: SessionConfig,
    state: SessionState,
    /// Any byte other than `0x00` seen since the session started.
    heard: bool,
    last_command_at: Option<Instant>,
    /// When the outstanding block was sent, if one is awaiting its ACK.
    sent_at: Option<Instant>,
    retries: u32,
    retransmissions: usize,
}

impl ProgrammingSession {
    pub fn new(variant: ProtocolVariant, image: MemoryImage, config: SessionConfig) -> Self {
        Self {
            variant,
            image,
            config,
            state: SessionState::Idle,
            heard: false,
            last_command_at: None,
            sent_at: None,
            retries: 0,
            retransmissions: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn total_blocks(&self) -> usize {
        self.image.len().div_ceil(BLOCK_SIZE)
    }

    /// `None` while the session is still running.
    pub fn outcome(&self) -> Option<Result<TransferSummary>> {
        match self.state {
            SessionState::Completed => Some(Ok(TransferSummary {
                blocks: self.total_blocks(),
                retransmissions: self.retransmissions,
                bytes: self.image.len(),
                elapsed: Duration::ZERO,
            })),
            SessionState::Aborted(reason) => Some(Err(reason.into())),
            _ => None,
        }
    }

    /// Sends the first connect sequence.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        if self.state != SessionState::Idle {
            return vec![];
        }
        info!("Connecting using {} protocol", self.variant.name);
        self.state = SessionState::Connecting { attempts: 1 };
        self.last_command_at = Some(now);
        vec![Action::Send(self.variant.connect.to_vec())]
    }

    /// Handles one byte received from the radio.
    pub fn on_byte(&mut self, byte: u8, now: Instant) -> Vec<Action> {
        trace!("Received {:#04X} in {}", byte, self.state);
        match byte {
            PRESENCE => {
                debug!("Radio is present");
                vec![]
            }
            ACK => {
                self.heard = true;
                self.on_ack(now)
            }
            NAK => {
                self.heard = true;
                self.on_nak(now)
            }
            other => {
                self.heard = true;
                debug!("Ignoring unexpected byte {:#04X} in {}", other, self.state);
                vec![]
            }
        }
    }

    /// Checks the clock: connect retries, handshake timeout and block ACK timeout.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let since_command = self
            .last_command_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        match self.state {
            SessionState::Connecting { attempts } if !self.heard => {
                if since_command < self.config.connect_interval {
                    return vec![];
                }
                if attempts >= self.config.connect_attempts {
                    warn!("No answer after {} connect attempts", attempts);
                    return self.abort(AbortReason::NoResponse);
                }
                debug!("No answer yet, connect attempt {}", attempts + 1);
                self.state = SessionState::Connecting {
                    attempts: attempts + 1,
                };
                self.last_command_at = Some(now);
                vec![Action::Send(self.variant.connect.to_vec())]
            }
            SessionState::Connecting { .. }
            | SessionState::Handshaking { .. }
            | SessionState::UpdateSent => {
                if since_command > self.config.handshake_timeout {
                    let stage = self.state.stage();
                    return self.abort(AbortReason::HandshakeTimeout { stage });
                }
                vec![]
            }
            SessionState::Transferring { .. } => match self.sent_at {
                Some(at) if now.saturating_duration_since(at) > self.config.ack_timeout => {
                    warn!(
                        "No ACK after {:.1} seconds",
                        now.saturating_duration_since(at).as_secs_f64()
                    );
                    self.retransmit(now)
                }
                _ => vec![],
            },
            SessionState::Idle | SessionState::Completed | SessionState::Aborted(_) => vec![],
        }
    }

    fn command(&mut self, sequence: [u8; 5], now: Instant) -> Vec<Action> {
        self.last_command_at = Some(now);
        vec![
            Action::Send(sequence.to_vec()),
            Action::Pause(self.config.command_delay),
        ]
    }

    fn on_ack(&mut self, now: Instant) -> Vec<Action> {
        match self.state {
            SessionState::Connecting { .. } => {
                debug!("Connection step 2, sending connect command");
                self.state = SessionState::Handshaking { step: 2 };
                self.command(self.variant.connect, now)
            }
            SessionState::Handshaking { step } if step < 3 => {
                debug!("Connection step {}, sending connect command", step + 1);
                self.state = SessionState::Handshaking { step: step + 1 };
                self.command(self.variant.connect, now)
            }
            SessionState::Handshaking { .. } => {
                info!("Handshake complete, sending update command");
                self.state = SessionState::UpdateSent;
                self.command(self.variant.update, now)
            }
            SessionState::UpdateSent => {
                info!(
                    "Radio ready, sending {} blocks",
                    self.total_blocks()
                );
                self.state = SessionState::Transferring { cursor: 0 };
                self.next_block(0, now)
            }
            SessionState::Transferring { cursor } => {
                self.retries = 0;
                self.sent_at = None;
                self.next_block(cursor, now)
            }
            SessionState::Idle | SessionState::Completed | SessionState::Aborted(_) => {
                debug!("Ignoring ACK in {}", self.state);
                vec![]
            }
        }
    }

    fn on_nak(&mut self, now: Instant) -> Vec<Action> {
        match self.state {
            SessionState::Transferring { cursor } => {
                let offset = cursor.saturating_sub(BLOCK_SIZE);
                warn!("NAK received, block at offset {:#08X} rejected", offset);
                self.retransmit(now)
            }
            SessionState::Connecting { .. }
            | SessionState::Handshaking { .. }
            | SessionState::UpdateSent => {
                let stage = self.state.stage();
                warn!("NAK received during {}", stage);
                self.abort(AbortReason::NakDuringHandshake { stage })
            }
            SessionState::Idle | SessionState::Completed | SessionState::Aborted(_) => vec![],
        }
    }

    /// Sends the block at `cursor`, or the end sequence once the whole image is out.
    fn next_block(&mut self, cursor: usize, now: Instant) -> Vec<Action> {
        if cursor < self.image.len() {
            return self.send_block(now, false);
        }
        info!("Data transfer completed, sending end command");
        self.state = SessionState::Completed;
        self.last_command_at = Some(now);
        vec![
            Action::Send(self.variant.end.to_vec()),
            Action::Pause(self.config.end_delay),
        ]
    }

    fn abort(&mut self, reason: AbortReason) -> Vec<Action> {
        self.state = SessionState::Aborted(reason);
        self.sent_at = None;
        vec![]
    }

    /// Steps the cursor back over the outstanding block and sends it again.
    fn retransmit(&mut self, now: Instant) -> Vec<Action> {
        let SessionState::Transferring { cursor } = self.state else {
            return vec![];
        };
        let offset = cursor.saturating_sub(BLOCK_SIZE);
        self.retries += 1;
        if self.retries > self.config.max_retries {
            warn!("Max retries exceeded, aborting transfer");
            return self.abort(AbortReason::MaxRetriesExceeded {
                offset: offset as u32,
                attempts: self.retries,
            });
        }
        info!(
            "Retrying block at offset {:#08X} (attempt {}/{})",
            offset, self.retries, self.config.max_retries
        );
        self.retransmissions += 1;
        self.state = SessionState::Transferring { cursor: offset };
        self.send_block(now, true)
    }

    fn send_block(&mut self, now: Instant, retransmission: bool) -> Vec<Action> {
        let SessionState::Transferring { cursor } = self.state else {
            return vec![];
        };
        // The offset field only holds the low 16 bits of the image offset.
        let packet = packet::block_write(
            cursor as u16,
            self.image.block(cursor, BLOCK_SIZE),
            self.variant.checksum,
        );
        debug!(
            "Sending block at offset {:#08X}, checksum {:#04X}",
            cursor,
            packet[packet.len() - 1]
        );
        let progress = Progress {
            block: cursor / BLOCK_SIZE + 1,
            total: self.total_blocks(),
            offset: cursor as u32,
            retransmission,
        };
        self.state = SessionState::Transferring {
            cursor: cursor + BLOCK_SIZE,
        };
        self.sent_at = Some(now);
        vec![Action::Send(packet), Action::Progress(progress)]
    }
}

enum Event {
    Byte(u8),
    ReadFailed(io::Error),
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    events: Sender<Event>,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || {
            let mut buffer = [0u8; 64];
            while !stop.load(Ordering::Relaxed) {
                match reader.read(&mut buffer) {
                    Ok(0) => thread::sleep(Duration::from_millis(1)),
                    Ok(count) => {
                        for byte in &buffer[..count] {
                            if events.send(Event::Byte(*byte)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) => {}
                    Err(err) => {
                        let _ = events.send(Event::ReadFailed(err));
                        return;
                    }
                }
            }
            debug!("Serial reader stopped");
        })
}

fn apply<T, F>(transport: &mut T, actions: Vec<Action>, on_progress: &mut F) -> Result<()>
where
    T: Transport + ?Sized,
    F: FnMut(&Progress),
{
    for action in actions {
        match action {
            Action::Send(bytes) => {
                trace!("Sending {} bytes: {:02X?}", bytes.len(), &bytes[..bytes.len().min(16)]);
                transport.write_all(&bytes)?;
                transport.flush()?;
            }
            Action::Pause(delay) => thread::sleep(delay),
            Action::Progress(progress) => on_progress(&progress),
        }
    }
    Ok(())
}

fn drive<T, F>(
    transport: &mut T,
    session: &mut ProgrammingSession,
    events: &Receiver<Event>,
    on_progress: &mut F,
) -> Result<TransferSummary>
where
    T: Transport + ?Sized,
    F: FnMut(&Progress),
{
    let start = Instant::now();
    apply(transport, session.start(Instant::now()), on_progress)?;

    let poll_interval = session.config().poll_interval;
    loop {
        if let Some(outcome) = session.outcome() {
            return outcome.map(|summary| TransferSummary {
                elapsed: start.elapsed(),
                ..summary
            });
        }

        let actions = match events.recv_timeout(poll_interval) {
            Ok(Event::Byte(byte)) => session.on_byte(byte, Instant::now()),
            Ok(Event::ReadFailed(err)) => return Err(err.into()),
            Err(RecvTimeoutError::Timeout) => vec![],
            Err(RecvTimeoutError::Disconnected) => return Err(Error::Disconnected),
        };
        apply(transport, actions, on_progress)?;

        // Checked on every pass so a chatty line cannot hide a missing ACK.
        let actions = session.on_tick(Instant::now());
        apply(transport, actions, on_progress)?;
    }
}

/// Runs `session` over `transport` until it completes or aborts.
///
/// The transport is closed (dropped) before returning, whatever the outcome, and the reader
/// thread has exited by then.
pub fn program<T, F>(
    mut transport: T,
    mut session: ProgrammingSession,
    mut on_progress: F,
) -> Result<TransferSummary>
where
    T: Transport,
    F: FnMut(&Progress),
{
    let reader = transport.try_clone_reader()?;
    let stop = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = mpsc::channel();
    let handle = spawn_reader(reader, sender, Arc::clone(&stop))?;

    let result = drive(&mut transport, &mut session, &receiver, &mut on_progress);

    stop.store(true, Ordering::Relaxed);
    drop(receiver);
    if handle.join().is_err() {
        warn!("Serial reader thread panicked");
    }
    drop(transport);

    match &result {
        Ok(summary) => info!(
            "Sent {} blocks in {:.1} s with {} retransmissions",
            summary.blocks,
            summary.elapsed.as_secs_f64(),
            summary.retransmissions
        ),
        Err(err) => warn!("Session ended in {}: {}", session.state(), err),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;

    fn session(blocks: usize) -> ProgrammingSession {
        let mut image = MemoryImage::new(blocks * BLOCK_SIZE, 0xFF);
        for block in 0..blocks {
            image.write((block * BLOCK_SIZE) as i64, block as u8);
        }
        ProgrammingSession::new(
            ProtocolVariant::RETEVIS,
            image,
            SessionConfig::default(),
        )
    }

    fn sent(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Walks a fresh session through the handshake, returning the first data packet.
    fn handshake(session: &mut ProgrammingSession, now: Instant) -> Vec<u8> {
        session.start(now);
        for _ in 0..3 {
            session.on_byte(ACK, now);
        }
        assert_eq!(session.state(), SessionState::UpdateSent);
        let actions = session.on_byte(ACK, now);
        sent(&actions).remove(0)
    }

    #[test]
    fn handshake_sends_connect_three_times_then_update() {
        let now = Instant::now();
        let mut session = session(2);
        let variant = ProtocolVariant::RETEVIS;

        assert_eq!(sent(&session.start(now)), vec![variant.connect.to_vec()]);
        assert_eq!(sent(&session.on_byte(PRESENCE, now)), Vec::<Vec<u8>>::new());
        assert_eq!(
            sent(&session.on_byte(ACK, now)),
            vec![variant.connect.to_vec()]
        );
        assert_eq!(session.state(), SessionState::Handshaking { step: 2 });
        assert_eq!(
            sent(&session.on_byte(ACK, now)),
            vec![variant.connect.to_vec()]
        );
        assert_eq!(session.state(), SessionState::Handshaking { step: 3 });
        assert_eq!(
            sent(&session.on_byte(ACK, now)),
            vec![variant.update.to_vec()]
        );
        assert_eq!(session.state(), SessionState::UpdateSent);
    }

    #[test]
    fn blocks_go_out_in_order_then_end() {
        let now = Instant::now();
        let mut session = session(3);
        let first = handshake(&mut session, now);
        assert_eq!(packet::number(&first), Some(0));
        assert!(Checksum::with_offset(82).verify(&first));

        let second = sent(&session.on_byte(ACK, now)).remove(0);
        assert_eq!(packet::number(&second), Some(1024));
        assert_eq!(packet::payload(&second)[0], 1);

        let third = sent(&session.on_byte(ACK, now)).remove(0);
        assert_eq!(packet::number(&third), Some(2048));

        let end = sent(&session.on_byte(ACK, now));
        assert_eq!(end, vec![ProtocolVariant::RETEVIS.end.to_vec()]);
        assert_eq!(session.state(), SessionState::Completed);
        let summary = session.outcome().unwrap().unwrap();
        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.retransmissions, 0);
    }

    #[test]
    fn empty_image_sends_no_blocks() {
        let now = Instant::now();
        let mut session = ProgrammingSession::new(
            ProtocolVariant::RETEVIS,
            MemoryImage::new(0, 0xFF),
            SessionConfig::default(),
        );
        session.start(now);
        for _ in 0..3 {
            session.on_byte(ACK, now);
        }

        let actions = session.on_byte(ACK, now);
        assert_eq!(sent(&actions), vec![ProtocolVariant::RETEVIS.end.to_vec()]);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, Action::Progress(_))));
        assert_eq!(session.state(), SessionState::Completed);
        let summary = session.outcome().unwrap().unwrap();
        assert_eq!(summary.blocks, 0);
        assert_eq!(summary.bytes, 0);
    }

    #[test]
    fn nak_during_handshake_aborts() {
        let now = Instant::now();
        let mut session = session(1);
        session.start(now);
        session.on_byte(ACK, now);
        session.on_byte(NAK, now);
        assert_eq!(
            session.state(),
            SessionState::Aborted(AbortReason::NakDuringHandshake { stage: "handshake" })
        );
        assert!(matches!(
            session.outcome(),
            Some(Err(Error::NakDuringHandshake { .. }))
        ));
    }

    #[test]
    fn nak_resends_same_block() {
        let now = Instant::now();
        let mut session = session(2);
        let first = handshake(&mut session, now);
        let again = sent(&session.on_byte(NAK, now)).remove(0);
        assert_eq!(first, again);
        assert_eq!(session.retries(), 1);

        // An ACK clears the counter and moves on.
        let next = sent(&session.on_byte(ACK, now)).remove(0);
        assert_eq!(packet::number(&next), Some(1024));
        assert_eq!(session.retries(), 0);
    }

    #[test]
    fn retry_ceiling_aborts() {
        let now = Instant::now();
        let mut session = session(2);
        handshake(&mut session, now);
        for _ in 0..3 {
            assert_eq!(sent(&session.on_byte(NAK, now)).len(), 1);
        }
        assert!(sent(&session.on_byte(NAK, now)).is_empty());
        assert_eq!(
            session.state(),
            SessionState::Aborted(AbortReason::MaxRetriesExceeded {
                offset: 0,
                attempts: 4
            })
        );
    }

    #[test]
    fn missing_ack_is_retried_after_timeout() {
        let now = Instant::now();
        let mut session = session(2);
        let first = handshake(&mut session, now);

        assert!(session.on_tick(now + Duration::from_secs(2)).is_empty());
        let actions = session.on_tick(now + Duration::from_millis(3100));
        assert_eq!(sent(&actions), vec![first]);
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Progress(Progress {
                retransmission: true,
                ..
            })
        )));
    }

    #[test]
    fn silent_radio_gets_four_connects() {
        let start = Instant::now();
        let mut session = session(1);
        let mut connects = sent(&session.start(start)).len();
        for tick in 1..=10 {
            let now = start + Duration::from_millis(200 * tick);
            connects += sent(&session.on_tick(now)).len();
        }
        assert_eq!(connects, 4);
        assert_eq!(
            session.state(),
            SessionState::Aborted(AbortReason::NoResponse)
        );
    }

    #[test]
    fn presence_bytes_do_not_stop_connect_retries() {
        let start = Instant::now();
        let mut session = session(1);
        session.start(start);
        session.on_byte(PRESENCE, start);
        let actions = session.on_tick(start + Duration::from_millis(250));
        assert_eq!(sent(&actions), vec![ProtocolVariant::RETEVIS.connect.to_vec()]);
    }

    #[test]
    fn stalled_handshake_times_out() {
        let start = Instant::now();
        let mut session = session(1);
        session.start(start);
        session.on_byte(ACK, start);
        session.on_tick(start + Duration::from_secs(4));
        assert_eq!(
            session.state(),
            SessionState::Aborted(AbortReason::HandshakeTimeout { stage: "handshake" })
        );
    }
}
