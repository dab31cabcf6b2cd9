//! Tokio driver for a [`TransactionManager`].
//!
//! The manager is synchronous and single-threaded by construction. The driver
//! pins it to one task: every network APDU, application call and timer expiry
//! is handled there, one at a time, so the tables need no locking. Anything
//! else talks to the task through a cloneable [`DriverHandle`].
//!
//! ```text
//!  DriverHandle --commands--> [ Driver task: TransactionManager ] --transmit--> network
//!                                     ^ sleep_until(poll_timeout)  --deliveries--> application
//! ```

use log::{debug, error, trace};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant as TokioInstant};

use crate::apdu::Apdu;
use crate::device_info::{DeviceInfoCache, DeviceInfoTable};
use crate::error::{Result, TsmError};
use crate::tsm::{CommunicationControl, Delivery, TransactionManager};

enum Command {
    Network(Apdu),
    Request {
        apdu: Apdu,
        reply: oneshot::Sender<Result<Option<u8>>>,
    },
    Answer {
        apdu: Apdu,
        reply: oneshot::Sender<Result<()>>,
    },
    CommunicationControl(CommunicationControl),
}

enum Wake {
    Command(Option<Command>),
    Timer,
}

/// Cloneable access to a running [`Driver`].
#[derive(Clone)]
pub struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DriverHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TsmError::DriverClosed)
    }

    /// An APDU decoded from the network.
    pub fn network_input(&self, apdu: Apdu) -> Result<()> {
        self.send(Command::Network(apdu))
    }

    /// Send a request from the application; resolves to the invoke ID used
    /// for confirmed requests.
    pub async fn request(&self, apdu: Apdu) -> Result<Option<u8>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Request { apdu, reply })?;
        response.await.map_err(|_| TsmError::DriverClosed)?
    }

    /// Answer a request previously delivered to the application.
    pub async fn answer(&self, apdu: Apdu) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Answer { apdu, reply })?;
        response.await.map_err(|_| TsmError::DriverClosed)?
    }

    pub fn set_communication_control(&self, control: CommunicationControl) -> Result<()> {
        self.send(Command::CommunicationControl(control))
    }
}

/// Single task owning a [`TransactionManager`].
pub struct Driver<C: DeviceInfoCache = DeviceInfoTable> {
    manager: TransactionManager<C>,
    commands: mpsc::UnboundedReceiver<Command>,
    transmit: mpsc::UnboundedSender<Apdu>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl<C: DeviceInfoCache> Driver<C> {
    /// Wrap `manager`.
    ///
    /// Returns the driver, a handle to it, the APDUs for the network and the
    /// messages for the application.
    pub fn new(
        manager: TransactionManager<C>,
    ) -> (
        Self,
        DriverHandle,
        mpsc::UnboundedReceiver<Apdu>,
        mpsc::UnboundedReceiver<Delivery>,
    ) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (transmit, transmit_rx) = mpsc::unbounded_channel();
        let (deliveries, delivery_rx) = mpsc::unbounded_channel();
        let driver = Self {
            manager,
            commands,
            transmit,
            deliveries,
        };
        (driver, DriverHandle { commands: command_tx }, transmit_rx, delivery_rx)
    }

    /// Run until every handle is dropped, then give the manager back.
    ///
    /// Stops early with the first fault raised by the manager.
    pub async fn run(mut self) -> Result<TransactionManager<C>> {
        loop {
            self.flush();

            let deadline = self.manager.poll_timeout().map(TokioInstant::from_std);
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                () = timer => Wake::Timer,
            };

            let now = TokioInstant::now().into_std();
            let outcome = match wake {
                Wake::Command(Some(command)) => self.execute(command, now),
                Wake::Command(None) => {
                    debug!("All driver handles dropped, stopping");
                    self.flush();
                    return Ok(self.manager);
                }
                Wake::Timer => self.manager.handle_timeout(now),
            };

            if let Err(e) = outcome {
                error!("Transaction driver stopped: {}", e);
                self.flush();
                return Err(e);
            }
        }
    }

    fn execute(&mut self, command: Command, now: std::time::Instant) -> Result<()> {
        match command {
            Command::Network(apdu) => self.manager.confirmation(apdu, now),
            Command::Request { apdu, reply } => {
                // Caller mistakes go back to the caller
                let result = self.manager.sap_indication(apdu, now);
                if reply.send(result).is_err() {
                    trace!("Requester went away before the reply");
                }
                Ok(())
            }
            Command::Answer { apdu, reply } => {
                let result = self.manager.sap_confirmation(apdu, now);
                if reply.send(result).is_err() {
                    trace!("Answerer went away before the reply");
                }
                Ok(())
            }
            Command::CommunicationControl(control) => {
                self.manager.set_communication_control(control);
                Ok(())
            }
        }
    }

    /// Move queued output to the channels.
    fn flush(&mut self) {
        while let Some(apdu) = self.manager.poll_transmit() {
            if self.transmit.send(apdu).is_err() {
                trace!("Network receiver closed, APDU discarded");
            }
        }
        while let Some(delivery) = self.manager.poll_delivery() {
            if self.deliveries.send(delivery).is_err() {
                trace!("Application receiver closed, delivery discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::address::Address;
    use crate::apdu::{AbortReason, ConfirmedRequest, Pdu, SimpleAck};
    use crate::config::TsmConfig;

    fn peer() -> Address {
        Address::LocalStation(vec![10, 0, 0, 9, 0xba, 0xc0])
    }

    fn manager() -> TransactionManager {
        TransactionManager::new(TsmConfig::default(), DeviceInfoTable::new()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_and_reply() {
        let (driver, handle, mut transmit, mut deliveries) = Driver::new(manager());
        let task = tokio::spawn(driver.run());

        let invoke_id = handle
            .request(Apdu::new(peer(), ConfirmedRequest::new(12, vec![1])))
            .await
            .unwrap()
            .unwrap();
        let sent = transmit.recv().await.unwrap();
        assert_eq!(sent.peer, peer());
        assert_eq!(sent.pdu.invoke_id(), Some(invoke_id));

        handle
            .network_input(Apdu::new(peer(), SimpleAck { invoke_id, service_choice: 12 }))
            .unwrap();
        match deliveries.recv().await.unwrap() {
            Delivery::Response(apdu) => assert!(matches!(apdu.pdu, Pdu::SimpleAck(_))),
            other => panic!("unexpected {:?}", other),
        }

        drop(handle);
        let manager = task.await.unwrap().unwrap();
        assert_eq!(manager.stats().total_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (driver, handle, mut transmit, mut deliveries) = Driver::new(manager());
        tokio::spawn(driver.run());

        let start = TokioInstant::now();
        handle
            .request(Apdu::new(peer(), ConfirmedRequest::new(12, vec![1])))
            .await
            .unwrap();

        match deliveries.recv().await.unwrap() {
            Delivery::Response(Apdu { pdu: Pdu::Abort(abort), .. }) => {
                assert_eq!(abort.reason, AbortReason::NoResponse)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(12_000));

        // Original send plus three retries
        let mut sent = 0;
        while transmit.try_recv().is_ok() {
            sent += 1;
        }
        assert_eq!(sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_errors_do_not_stop_driver() {
        let (driver, handle, _transmit, _deliveries) = Driver::new(manager());
        let task = tokio::spawn(driver.run());

        let result = handle
            .request(Apdu::new(
                Address::GlobalBroadcast,
                ConfirmedRequest::new(12, vec![]),
            ))
            .await;
        assert_eq!(result, Err(TsmError::NotAStation(Address::GlobalBroadcast)));

        let result = handle
            .request(Apdu::new(peer(), ConfirmedRequest::new(12, vec![])))
            .await;
        assert_eq!(result, Ok(Some(0)));

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_driver() {
        let (driver, handle, _transmit, _deliveries) = Driver::new(manager());
        drop(driver);

        assert_eq!(
            handle.network_input(Apdu::new(peer(), SimpleAck { invoke_id: 0, service_choice: 12 })),
            Err(TsmError::DriverClosed)
        );
        assert_eq!(
            handle
                .request(Apdu::new(peer(), ConfirmedRequest::new(12, vec![])))
                .await,
            Err(TsmError::DriverClosed)
        );
    }
}
