//! Transaction manager: the application service access point.
//!
//! The manager owns every live transaction of one local endpoint. It is the
//! only place transactions are created and destroyed, and the only route
//! between a state machine and the outside world.
//!
//! ```text
//!   application                                                network
//!       |                                                          |
//!       |--sap_indication(request)-->+--------------------+        |
//!       |                            |  client table      |--poll_transmit-->
//!       |<--poll_delivery(Response)--|  (invoke id, dest) |        |
//!       |                            +--------------------+        |
//!       |                            |  server table      |<--confirmation--
//!       |<--poll_delivery(Request)---|  (invoke id, src)  |        |
//!       |--sap_confirmation(answer)->+--------------------+        |
//! ```
//!
//! Nothing here blocks or sleeps. Output is queued and drained by the caller;
//! time only advances when the caller says so through
//! [`handle_timeout`](TransactionManager::handle_timeout).

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::address::Address;
use crate::apdu::{service, Apdu, Pdu};
use crate::config::TsmConfig;
use crate::device_info::{DeviceInfoCache, DeviceInfoTable};
use crate::error::{Result, TsmError};
use crate::ssm::{Context, Effect, Event, Role, Ssm, State};

/// Key for looking up a transaction in either table
///
/// Invoke IDs are only unique per peer, so the peer address is part of the key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TransactionKey {
    /// Invoke ID of the confirmed request (0-255)
    pub invoke_id: u8,
    /// Destination (client table) or source (server table)
    pub address: Address,
}

impl TransactionKey {
    pub fn new(invoke_id: u8, address: Address) -> Self {
        Self { invoke_id, address }
    }
}

/// Something for the local application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A request from a peer, or the fate of a request we are serving.
    Request(Apdu),
    /// The outcome of a request we sent.
    Response(Apdu),
}

/// DeviceCommunicationControl state of the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommunicationControl {
    #[default]
    Enable,
    /// Respond only to DeviceCommunicationControl and ReinitializeDevice.
    Disable,
    /// Do not initiate anything except I-Am.
    DisableInitiation,
}

impl CommunicationControl {
    /// Whether the application may send `pdu`.
    fn permits_outbound(self, pdu: &Pdu) -> bool {
        match (self, pdu) {
            (Self::Enable, _) => true,
            (Self::Disable, Pdu::ConfirmedRequest(request)) => matches!(
                request.service_choice,
                service::DEVICE_COMMUNICATION_CONTROL | service::REINITIALIZE_DEVICE
            ),
            (Self::Disable, Pdu::UnconfirmedRequest(request)) => {
                request.service_choice == service::WHO_IS
            }
            (Self::DisableInitiation, Pdu::UnconfirmedRequest(request)) => {
                request.service_choice == service::I_AM
            }
            _ => false,
        }
    }

    /// Whether `pdu` from the network is processed.
    fn permits_inbound(self, pdu: &Pdu) -> bool {
        match (self, pdu) {
            (Self::Disable, Pdu::ConfirmedRequest(request)) => matches!(
                request.service_choice,
                service::DEVICE_COMMUNICATION_CONTROL | service::REINITIALIZE_DEVICE
            ),
            (Self::Disable, Pdu::UnconfirmedRequest(_)) => false,
            _ => true,
        }
    }
}

/// Which table an inbound APDU is matched in; `None` for unconfirmed requests.
///
/// Abort and SegmentAck travel both ways; the `server` bit says which side sent them.
fn table_for(pdu: &Pdu) -> Option<Role> {
    match pdu {
        Pdu::UnconfirmedRequest(_) => None,
        Pdu::ConfirmedRequest(_) => Some(Role::Server),
        Pdu::SimpleAck(_) | Pdu::ComplexAck(_) | Pdu::Error(_) | Pdu::Reject(_) => {
            Some(Role::Client)
        }
        Pdu::Abort(abort) if abort.server => Some(Role::Client),
        Pdu::SegmentAck(ack) if ack.server => Some(Role::Client),
        Pdu::Abort(_) | Pdu::SegmentAck(_) => Some(Role::Server),
    }
}

/// Counters for the transaction tables
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransactionStats {
    /// Client transactions created
    pub total_client_created: u64,
    /// Server transactions created
    pub total_server_created: u64,
    /// Transactions that reached COMPLETED
    pub total_completed: u64,
    /// Transactions that reached ABORTED
    pub total_aborted: u64,
    /// Whole-request retries
    pub total_retries: u64,
    /// Window resends
    pub total_segment_retries: u64,
    /// APDUs that matched no transaction
    pub total_unmatched: u64,
    /// Client transactions currently live
    pub active_client: usize,
    /// Server transactions currently live
    pub active_server: usize,
}

/// Owner of all transactions of one local endpoint.
pub struct TransactionManager<C: DeviceInfoCache = DeviceInfoTable> {
    config: TsmConfig,
    device_info_cache: C,
    next_invoke_id: u8,
    client_transactions: HashMap<TransactionKey, Ssm>,
    server_transactions: HashMap<TransactionKey, Ssm>,
    transmit: VecDeque<Apdu>,
    deliveries: VecDeque<Delivery>,
    communication_control: CommunicationControl,
    stats: TransactionStats,
}

impl<C: DeviceInfoCache> TransactionManager<C> {
    /// Create a manager after validating `config`.
    pub fn new(config: TsmConfig, device_info_cache: C) -> Result<Self> {
        config.validate()?;
        info!(
            "Transaction manager: max_apdu={} segmentation={:?} retries={} window={}",
            config.max_apdu_length_accepted,
            config.segmentation_supported,
            config.number_of_apdu_retries,
            config.proposed_window_size
        );
        Ok(Self {
            config,
            device_info_cache,
            next_invoke_id: 0,
            client_transactions: HashMap::new(),
            server_transactions: HashMap::new(),
            transmit: VecDeque::new(),
            deliveries: VecDeque::new(),
            communication_control: CommunicationControl::Enable,
            stats: TransactionStats::default(),
        })
    }

    pub fn config(&self) -> &TsmConfig {
        &self.config
    }

    pub fn device_info_cache(&self) -> &C {
        &self.device_info_cache
    }

    pub fn device_info_cache_mut(&mut self) -> &mut C {
        &mut self.device_info_cache
    }

    pub fn communication_control(&self) -> CommunicationControl {
        self.communication_control
    }

    pub fn set_communication_control(&mut self, control: CommunicationControl) {
        if control != self.communication_control {
            info!("Communication control {:?} -> {:?}", self.communication_control, control);
        }
        self.communication_control = control;
    }

    /// Get current statistics
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// The client transaction for `invoke_id` toward `address`, if live.
    pub fn client_transaction(&self, invoke_id: u8, address: &Address) -> Option<&Ssm> {
        self.client_transactions
            .get(&TransactionKey::new(invoke_id, address.clone()))
    }

    /// The server transaction for `invoke_id` from `address`, if live.
    pub fn server_transaction(&self, invoke_id: u8, address: &Address) -> Option<&Ssm> {
        self.server_transactions
            .get(&TransactionKey::new(invoke_id, address.clone()))
    }

    pub fn active_client_transactions(&self) -> usize {
        self.client_transactions.len()
    }

    pub fn active_server_transactions(&self) -> usize {
        self.server_transactions.len()
    }

    /// Allocate an invoke ID not bound to a live client transaction toward `address`.
    pub fn get_next_invoke_id(&mut self, address: &Address) -> Result<u8> {
        let start = self.next_invoke_id;
        loop {
            let invoke_id = self.next_invoke_id;
            self.next_invoke_id = invoke_id.wrapping_add(1);

            let key = TransactionKey::new(invoke_id, address.clone());
            if !self.client_transactions.contains_key(&key) {
                return Ok(invoke_id);
            }
            if self.next_invoke_id == start {
                warn!("Invoke ID space exhausted for {}", address);
                return Err(TsmError::InvokeIdExhausted(address.clone()));
            }
        }
    }

    /// An APDU from the application for the network.
    ///
    /// Confirmed requests start a client transaction; the invoke ID used is
    /// returned. Returns `Ok(None)` for unconfirmed requests and for anything
    /// suppressed by communication control.
    pub fn sap_indication(&mut self, apdu: Apdu, now: Instant) -> Result<Option<u8>> {
        if !self.communication_control.permits_outbound(&apdu.pdu) {
            debug!(
                "{} to {} suppressed by {:?}",
                apdu.pdu.kind(),
                apdu.peer,
                self.communication_control
            );
            return Ok(None);
        }

        let Apdu { peer, pdu } = apdu;
        let mut request = match pdu {
            Pdu::UnconfirmedRequest(request) => {
                self.transmit.push_back(Apdu::new(peer, request));
                return Ok(None);
            }
            Pdu::ConfirmedRequest(request) => request,
            other => return Err(TsmError::UnroutableApdu(other.kind())),
        };

        if !peer.is_station() {
            return Err(TsmError::NotAStation(peer));
        }

        let invoke_id = match request.invoke_id {
            Some(invoke_id) => {
                let key = TransactionKey::new(invoke_id, peer.clone());
                if self.client_transactions.contains_key(&key) {
                    return Err(TsmError::InvokeIdInUse {
                        invoke_id,
                        address: peer,
                    });
                }
                invoke_id
            }
            None => self.get_next_invoke_id(&peer)?,
        };
        request.invoke_id = Some(invoke_id);

        let device_info = self.device_info_cache.acquire_device_info(&peer);
        let ssm = Ssm::new(
            Role::Client,
            peer.clone(),
            invoke_id,
            self.config.clone(),
            device_info,
        );
        let key = TransactionKey::new(invoke_id, peer.clone());
        self.client_transactions.insert(key.clone(), ssm);
        self.stats.total_client_created += 1;
        self.stats.active_client = self.client_transactions.len();
        debug!(
            "Added client transaction: invoke_id={} service={} dest={}",
            invoke_id, request.service_choice, peer
        );

        self.step(Role::Client, &key, Event::Indication(Apdu::new(peer, request)), now)?;
        Ok(Some(invoke_id))
    }

    /// The application's answer to a request it was delivered.
    pub fn sap_confirmation(&mut self, apdu: Apdu, now: Instant) -> Result<()> {
        let answer = matches!(
            apdu.pdu,
            Pdu::SimpleAck(_) | Pdu::ComplexAck(_) | Pdu::Error(_) | Pdu::Reject(_) | Pdu::Abort(_)
        );
        if !answer {
            return Err(TsmError::UnroutableApdu(apdu.pdu.kind()));
        }
        let invoke_id = apdu.pdu.invoke_id().ok_or(TsmError::MissingInvokeId)?;

        let key = TransactionKey::new(invoke_id, apdu.peer.clone());
        if !self.server_transactions.contains_key(&key) {
            warn!(
                "No server transaction for {} invoke_id={} from {}",
                apdu.pdu.kind(),
                invoke_id,
                apdu.peer
            );
            self.stats.total_unmatched += 1;
            return Ok(());
        }
        self.step(Role::Server, &key, Event::Confirmation(apdu), now)
    }

    /// An APDU from the network.
    pub fn confirmation(&mut self, apdu: Apdu, now: Instant) -> Result<()> {
        if !self.communication_control.permits_inbound(&apdu.pdu) {
            debug!(
                "{} from {} ignored under {:?}",
                apdu.pdu.kind(),
                apdu.peer,
                self.communication_control
            );
            return Ok(());
        }

        let role = match table_for(&apdu.pdu) {
            Some(role) => role,
            None => {
                self.deliveries.push_back(Delivery::Request(apdu));
                return Ok(());
            }
        };
        let invoke_id = apdu.pdu.invoke_id().ok_or(TsmError::MissingInvokeId)?;
        if matches!(apdu.pdu, Pdu::ConfirmedRequest(_)) {
            self.ensure_server_transaction(invoke_id, &apdu.peer);
        }

        let key = TransactionKey::new(invoke_id, apdu.peer.clone());
        let known = match role {
            Role::Client => self.client_transactions.contains_key(&key),
            Role::Server => self.server_transactions.contains_key(&key),
        };
        if !known {
            warn!(
                "Dropping unmatched {}: invoke_id={} from {} ({:?} table)",
                apdu.pdu.kind(),
                key.invoke_id,
                key.address,
                role
            );
            self.stats.total_unmatched += 1;
            return Ok(());
        }

        let event = match role {
            Role::Client => Event::Confirmation(apdu),
            Role::Server => Event::Indication(apdu),
        };
        self.step(role, &key, event, now)
    }

    fn ensure_server_transaction(&mut self, invoke_id: u8, peer: &Address) {
        let key = TransactionKey::new(invoke_id, peer.clone());
        if self.server_transactions.contains_key(&key) {
            return;
        }
        let device_info = self.device_info_cache.acquire_device_info(peer);
        let ssm = Ssm::new(
            Role::Server,
            peer.clone(),
            invoke_id,
            self.config.clone(),
            device_info,
        );
        self.server_transactions.insert(key, ssm);
        self.stats.total_server_created += 1;
        self.stats.active_server = self.server_transactions.len();
        debug!("Added server transaction: invoke_id={} source={}", invoke_id, peer);
    }

    /// Earliest pending transaction deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.client_transactions
            .values()
            .chain(self.server_transactions.values())
            .filter_map(Ssm::deadline)
            .min()
    }

    /// Fire every transaction timer that expired at `now`, oldest first.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        let mut expired: Vec<(Instant, Role, TransactionKey)> = self
            .client_transactions
            .iter()
            .chain(self.server_transactions.iter())
            .filter(|(_, ssm)| ssm.is_expired(now))
            .filter_map(|(key, ssm)| Some((ssm.deadline()?, ssm.role(), key.clone())))
            .collect();
        expired.sort_by_key(|(deadline, _, _)| *deadline);

        for (_, role, key) in expired {
            trace!("Timer fired: {:?} invoke_id={} {}", role, key.invoke_id, key.address);
            self.step(role, &key, Event::Timeout, now)?;
        }
        Ok(())
    }

    /// Next APDU for the network.
    pub fn poll_transmit(&mut self) -> Option<Apdu> {
        self.transmit.pop_front()
    }

    /// Next message for the application.
    pub fn poll_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.pop_front()
    }

    /// Feed one event to a registered transaction and settle the outcome.
    fn step(&mut self, role: Role, key: &TransactionKey, event: Event, now: Instant) -> Result<()> {
        let table = match role {
            Role::Client => &mut self.client_transactions,
            Role::Server => &mut self.server_transactions,
        };
        let ssm = match table.get_mut(key) {
            Some(ssm) => ssm,
            None => return Ok(()),
        };

        let retries = ssm.retry_count();
        let segment_retries = ssm.segment_retry_count();
        let mut effects = Vec::new();
        let result = ssm.handle(event, &mut Context::new(now, &mut effects));

        if ssm.retry_count() > retries {
            self.stats.total_retries += 1;
        }
        if ssm.segment_retry_count() > segment_retries {
            self.stats.total_segment_retries += 1;
        }
        let finished = if ssm.state().is_terminal() {
            table.remove(key)
        } else {
            None
        };

        self.apply(effects);
        let released = match finished {
            Some(ssm) => self.finish(ssm),
            None => Ok(()),
        };
        result.and(released)
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Request(apdu) => self.transmit.push_back(apdu),
                Effect::DeliverRequest(apdu) => self.deliveries.push_back(Delivery::Request(apdu)),
                Effect::DeliverResponse(apdu) => self.deliveries.push_back(Delivery::Response(apdu)),
                Effect::UpdateDeviceInfo(info) => self.device_info_cache.update_device_info(info),
            }
        }
    }

    /// Account for a transaction that left its table.
    fn finish(&mut self, mut ssm: Ssm) -> Result<()> {
        match ssm.state() {
            State::Completed => self.stats.total_completed += 1,
            _ => self.stats.total_aborted += 1,
        }
        self.stats.active_client = self.client_transactions.len();
        self.stats.active_server = self.server_transactions.len();
        debug!(
            "Removed {:?} transaction: invoke_id={} peer={} state={:?}",
            ssm.role(),
            ssm.invoke_id(),
            ssm.peer(),
            ssm.state()
        );

        match ssm.take_device_info() {
            Some(info) => self.device_info_cache.release_device_info(&info),
            None => Ok(()),
        }
    }
}
