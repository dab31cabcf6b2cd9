//! BACnet application-layer transaction state machines
//!
//! This crate implements the transaction layer of BACnet (ASHRAE 135 clause 5):
//! invoke ID allocation, segmentation and reassembly of oversized APDUs with
//! windowed flow control, retries and timeouts for confirmed services.
//!
//! Encoding and decoding of APDUs, the network layer and the application's
//! services live elsewhere. The crate works on decoded [`Apdu`]s and hands its
//! output back through queues.
//!
//! ## Layering
//!
//! ```text
//!          application services
//!     sap_indication ^   | poll_delivery
//!   sap_confirmation |   v
//!   +---------------------------------+
//!   |       TransactionManager        |   client / server tables
//!   |   Ssm (Client)   Ssm (Server)   |   one machine per transaction
//!   +---------------------------------+
//!       confirmation ^   | poll_transmit
//!                    |   v
//!         APDU codec + network layer
//! ```
//!
//! ## Example
//!
//! ```
//! use std::time::Instant;
//! use bacnet_tsm::{Address, Apdu, ConfirmedRequest, DeviceInfoTable, TransactionManager, TsmConfig};
//!
//! let mut tsm = TransactionManager::new(TsmConfig::default(), DeviceInfoTable::new()).unwrap();
//! let peer = Address::LocalStation(vec![0x0A]);
//!
//! let invoke_id = tsm
//!     .sap_indication(Apdu::new(peer.clone(), ConfirmedRequest::new(12, vec![0x0C])), Instant::now())
//!     .unwrap();
//! assert_eq!(invoke_id, Some(0));
//!
//! let outbound = tsm.poll_transmit().unwrap();
//! assert_eq!(outbound.peer, peer);
//! ```
//!
//! ## Features
//!
//! - `async` (default): [`Driver`], a tokio task that owns a manager
//! - `serde` (default): serde derives on configuration and device records,
//!   bincode snapshots of a [`DeviceInfoTable`]

pub mod address;
pub mod apdu;
pub mod config;
pub mod device_info;
#[cfg(feature = "async")]
pub mod driver;
pub mod error;
pub mod ssm;
pub mod timer;
pub mod tsm;

pub use address::Address;
pub use apdu::{
    Abort, AbortReason, Apdu, ComplexAck, ConfirmedRequest, ErrorPdu, Pdu, Reject, SegmentAck,
    Segmentation, SimpleAck, UnconfirmedRequest,
};
pub use config::TsmConfig;
pub use device_info::{DeviceInfo, DeviceInfoCache, DeviceInfoTable, IAm};
#[cfg(feature = "async")]
pub use driver::{Driver, DriverHandle};
pub use error::{Result, TsmError};
pub use ssm::{Role, Ssm, State};
pub use tsm::{CommunicationControl, Delivery, TransactionKey, TransactionManager, TransactionStats};
