//! Segmentation state machines (SSM).
//!
//! One [`Ssm`] tracks one confirmed-service transaction. The same type plays
//! both roles of the exchange: a [`Role::Client`] machine drives a request
//! this device originates, a [`Role::Server`] machine drives a request this
//! device received. Both share the windowing and reassembly mechanics in
//! [`segmentation`]; their transition tables live in the private `client`
//! and `server` modules.
//!
//! ## Driving a machine
//!
//! A machine never performs I/O. [`Ssm::handle`] consumes one [`Event`] and
//! appends [`Effect`]s to the [`Context`] it is given; the owner (normally the
//! [`TransactionManager`](crate::TransactionManager)) routes those effects to
//! the network and the application.
//!
//! ```text
//!                 Indication        Confirmation        Timeout
//!  Client role    app request       peer reply          timer expired
//!  Server role    peer request      app answer          timer expired
//! ```
//!
//! ## States
//!
//! ```text
//! Client: IDLE -> SEGMENTED_REQUEST -> AWAIT_CONFIRMATION -> SEGMENTED_CONFIRMATION -> COMPLETED
//! Server: IDLE -> SEGMENTED_REQUEST -> AWAIT_RESPONSE     -> SEGMENTED_RESPONSE     -> COMPLETED
//!                          (any non-terminal state) ---------------------------------> ABORTED
//! ```
//!
//! COMPLETED and ABORTED are terminal. Asking a terminal machine to change
//! state is reported as [`TsmError::InvalidTransition`].

mod client;
pub mod segmentation;
mod server;

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::address::Address;
use crate::apdu::{Abort, AbortReason, Apdu, Pdu, SegmentAck};
use crate::config::TsmConfig;
use crate::device_info::DeviceInfo;
use crate::error::{Result, TsmError};
use crate::timer::Timer;

pub use segmentation::{in_window, segment_count, MAX_SEGMENTS};

/// Transaction states shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    SegmentedRequest,
    AwaitConfirmation,
    AwaitResponse,
    SegmentedResponse,
    SegmentedConfirmation,
    Completed,
    Aborted,
}

impl State {
    /// COMPLETED and ABORTED end a transaction.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Aborted)
    }
}

/// Which side of the confirmed service this machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The request originates here.
    Client,
    /// The request was received from the peer.
    Server,
}

/// Input to a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Client: request from the application. Server: APDU from the peer.
    Indication(Apdu),
    /// Client: APDU from the peer. Server: answer from the application.
    Confirmation(Apdu),
    /// The transaction timer expired.
    Timeout,
}

/// Output of a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Hand an APDU to the network layer.
    Request(Apdu),
    /// Deliver an APDU to the application on the serving side.
    DeliverRequest(Apdu),
    /// Deliver an APDU to the application on the requesting side.
    DeliverResponse(Apdu),
    /// The peer's capabilities were learned; store the record.
    UpdateDeviceInfo(DeviceInfo),
}

/// Per-event environment: the current time and the effect sink.
pub struct Context<'a> {
    pub now: Instant,
    pub effects: &'a mut Vec<Effect>,
}

impl<'a> Context<'a> {
    pub fn new(now: Instant, effects: &'a mut Vec<Effect>) -> Self {
        Self { now, effects }
    }
}

/// One confirmed-service transaction.
#[derive(Debug)]
pub struct Ssm {
    role: Role,
    peer: Address,
    invoke_id: u8,
    state: State,
    timer: Timer,
    config: TsmConfig,
    device_info: Option<DeviceInfo>,

    // Segmentation
    context: Option<segmentation::SegmentationContext>,
    segment_size: usize,
    segment_count: usize,
    segments_received: usize,
    sent_all_segments: bool,
    initial_sequence_number: u8,
    last_sequence_number: u8,
    actual_window_size: u8,

    // Retries
    retry_count: u8,
    segment_retry_count: u8,

    // What the client declared in its request (server role)
    segmented_response_accepted: bool,
    peer_max_apdu_length: Option<usize>,
    peer_max_segments: Option<u8>,
}

impl Ssm {
    /// Create a machine in the IDLE state.
    ///
    /// `device_info` is the peer's record, already checked out of the cache.
    pub fn new(
        role: Role,
        peer: Address,
        invoke_id: u8,
        config: TsmConfig,
        device_info: Option<DeviceInfo>,
    ) -> Self {
        Self {
            role,
            peer,
            invoke_id,
            state: State::Idle,
            timer: Timer::new(),
            config,
            device_info,
            context: None,
            segment_size: 0,
            segment_count: 0,
            segments_received: 0,
            sent_all_segments: false,
            initial_sequence_number: 0,
            last_sequence_number: 0,
            actual_window_size: 1,
            retry_count: 0,
            segment_retry_count: 0,
            segmented_response_accepted: false,
            peer_max_apdu_length: None,
            peer_max_segments: None,
        }
    }

    /// Feed one event to the machine.
    pub fn handle(&mut self, event: Event, cx: &mut Context<'_>) -> Result<()> {
        match self.role {
            Role::Client => self.client_event(event, cx),
            Role::Server => self.server_event(event, cx),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &Address {
        &self.peer
    }

    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Pending timer deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.timer.is_expired(now)
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn segment_retry_count(&self) -> u8 {
        self.segment_retry_count
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn actual_window_size(&self) -> u8 {
        self.actual_window_size
    }

    pub fn initial_sequence_number(&self) -> u8 {
        self.initial_sequence_number
    }

    pub fn last_sequence_number(&self) -> u8 {
        self.last_sequence_number
    }

    pub fn sent_all_segments(&self) -> bool {
        self.sent_all_segments
    }

    /// The checked-out peer record.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// Give the checked-out record back, so the owner can release it.
    pub fn take_device_info(&mut self) -> Option<DeviceInfo> {
        self.device_info.take()
    }

    /// Change state, cancelling any pending timer and optionally starting a new one.
    pub fn set_state(&mut self, new_state: State, timer: Option<Duration>, now: Instant) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TsmError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.timer.suspend();
        if self.state != new_state {
            debug!(
                "{:?} transaction {} with {}: {:?} -> {:?}",
                self.role, self.invoke_id, self.peer, self.state, new_state
            );
        }
        self.state = new_state;

        if let Some(delay) = timer.filter(|delay| !delay.is_zero()) {
            self.timer.install(now, delay);
        }
        Ok(())
    }

    fn restart_timer(&mut self, delay: Duration, now: Instant) {
        self.timer.install(now, delay);
    }

    /// Move to ABORTED and build the Abort APDU describing why.
    fn abort(&mut self, reason: AbortReason, now: Instant) -> Result<Abort> {
        warn!(
            "{:?} transaction {} with {} aborted: {:?}",
            self.role, self.invoke_id, self.peer, reason
        );
        self.set_state(State::Aborted, None, now)?;
        Ok(Abort {
            server: self.role == Role::Server,
            invoke_id: self.invoke_id,
            reason,
        })
    }

    /// Abort and report to the sides that have a stake in the transaction.
    fn abort_to(
        &mut self,
        reason: AbortReason,
        peer: bool,
        application: bool,
        cx: &mut Context<'_>,
    ) -> Result<()> {
        let abort = self.abort(reason, cx.now)?;
        if peer {
            self.to_network(abort, cx);
        }
        if application {
            self.to_application(abort, cx);
        }
        Ok(())
    }

    fn to_network(&self, pdu: impl Into<Pdu>, cx: &mut Context<'_>) {
        cx.effects
            .push(Effect::Request(Apdu::new(self.peer.clone(), pdu)));
    }

    fn to_application(&self, pdu: impl Into<Pdu>, cx: &mut Context<'_>) {
        let apdu = Apdu::new(self.peer.clone(), pdu);
        cx.effects.push(match self.role {
            Role::Client => Effect::DeliverResponse(apdu),
            Role::Server => Effect::DeliverRequest(apdu),
        });
    }

    fn send_segment_ack(&self, negative: bool, sequence_number: u8, cx: &mut Context<'_>) {
        let ack = SegmentAck {
            negative,
            server: self.role == Role::Server,
            invoke_id: self.invoke_id,
            sequence_number,
            window_size: self.actual_window_size,
        };
        self.to_network(ack, cx);
    }

    fn invalid(&self, pdu: &Pdu) -> TsmError {
        TsmError::InvalidApdu {
            state: self.state,
            kind: pdu.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Ssm {
        Ssm::new(
            Role::Client,
            Address::LocalStation(vec![1]),
            5,
            TsmConfig::default(),
            None,
        )
    }

    #[test]
    fn test_terminal_states() {
        assert!(State::Completed.is_terminal());
        assert!(State::Aborted.is_terminal());
        assert!(!State::Idle.is_terminal());
        assert!(!State::AwaitResponse.is_terminal());
    }

    #[test]
    fn test_set_state_installs_timer() {
        let now = Instant::now();
        let mut ssm = machine();
        ssm.set_state(State::AwaitConfirmation, Some(Duration::from_millis(300)), now)
            .unwrap();
        assert_eq!(ssm.deadline(), Some(now + Duration::from_millis(300)));

        ssm.set_state(State::SegmentedConfirmation, None, now).unwrap();
        assert_eq!(ssm.deadline(), None);
    }

    #[test]
    fn test_terminal_state_rejects_transition() {
        let now = Instant::now();
        let mut ssm = machine();
        ssm.set_state(State::Completed, None, now).unwrap();

        let err = ssm
            .set_state(State::AwaitConfirmation, Some(Duration::from_secs(1)), now)
            .unwrap_err();
        assert_eq!(
            err,
            TsmError::InvalidTransition {
                from: State::Completed,
                to: State::AwaitConfirmation,
            }
        );
        assert_eq!(ssm.state(), State::Completed);
        assert_eq!(ssm.deadline(), None);
    }

    #[test]
    fn test_abort_builds_pdu() {
        let now = Instant::now();
        let mut ssm = Ssm::new(
            Role::Server,
            Address::LocalStation(vec![2]),
            9,
            TsmConfig::default(),
            None,
        );
        let abort = ssm.abort(AbortReason::ServerTimeout, now).unwrap();
        assert!(abort.server);
        assert_eq!(abort.invoke_id, 9);
        assert_eq!(ssm.state(), State::Aborted);
        assert!(ssm.abort(AbortReason::Other, now).is_err());
    }
}
