//! Decoded application-layer PDUs.
//!
//! The transaction layer works on already-decoded messages. Each APDU kind
//! is a variant of [`Pdu`] carrying exactly the header fields the state
//! machines need; service parameters stay opaque in a [`Bytes`] buffer so
//! segments can be cut from it and appended to it without interpretation.
//!
//! | Kind                | Direction        | Matched in      |
//! |---------------------|------------------|-----------------|
//! | Confirmed-Request   | client -> server | server table    |
//! | Unconfirmed-Request | either           | not tracked     |
//! | Simple-ACK          | server -> client | client table    |
//! | Complex-ACK         | server -> client | client table    |
//! | Error / Reject      | server -> client | client table    |
//! | Abort               | either           | by `server` bit |
//! | Segment-ACK         | either           | by `server` bit |

use bytes::Bytes;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Service choices the access point needs to recognise.
pub mod service {
    /// Unconfirmed I-Am.
    pub const I_AM: u8 = 0;
    /// Unconfirmed Who-Is.
    pub const WHO_IS: u8 = 8;
    /// Confirmed DeviceCommunicationControl.
    pub const DEVICE_COMMUNICATION_CONTROL: u8 = 17;
    /// Confirmed ReinitializeDevice.
    pub const REINITIALIZE_DEVICE: u8 = 20;
}

/// Segmentation capability of a device (BACnetSegmentation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Segmentation {
    /// Segmented transmit and receive.
    Both = 0,
    /// Segmented transmit only.
    Transmit = 1,
    /// Segmented receive only.
    Receive = 2,
    /// No segmentation.
    #[default]
    None = 3,
}

impl Segmentation {
    /// Decode the enumerated value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Both),
            1 => Some(Self::Transmit),
            2 => Some(Self::Receive),
            3 => Some(Self::None),
            _ => None,
        }
    }

    /// Whether messages may be sent in segments.
    pub fn can_transmit(self) -> bool {
        matches!(self, Self::Both | Self::Transmit)
    }

    /// Whether segmented messages can be received.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::Both | Self::Receive)
    }

    /// The same capability with segmented receive added.
    pub fn with_receive(self) -> Self {
        match self {
            Self::None | Self::Receive => Self::Receive,
            Self::Transmit | Self::Both => Self::Both,
        }
    }
}

/// Reason carried by an Abort APDU.
///
/// `ServerTimeout` and `NoResponse` are local reasons in the proprietary
/// range, used when the transaction layer gives up on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    Other,
    BufferOverflow,
    InvalidApduInThisState,
    PreemptedByHigherPriorityTask,
    SegmentationNotSupported,
    SecurityError,
    InsufficientSecurity,
    WindowSizeOutOfRange,
    ApplicationExceededReplyTime,
    OutOfResources,
    TsmTimeout,
    ApduTooLong,
    /// The local application did not answer in time.
    ServerTimeout,
    /// The peer did not answer in time.
    NoResponse,
    Proprietary(u8),
}

impl AbortReason {
    /// Decode a reason code.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Other,
            1 => Self::BufferOverflow,
            2 => Self::InvalidApduInThisState,
            3 => Self::PreemptedByHigherPriorityTask,
            4 => Self::SegmentationNotSupported,
            5 => Self::SecurityError,
            6 => Self::InsufficientSecurity,
            7 => Self::WindowSizeOutOfRange,
            8 => Self::ApplicationExceededReplyTime,
            9 => Self::OutOfResources,
            10 => Self::TsmTimeout,
            11 => Self::ApduTooLong,
            64 => Self::ServerTimeout,
            65 => Self::NoResponse,
            other => Self::Proprietary(other),
        }
    }

    /// Encode the reason code.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Other => 0,
            Self::BufferOverflow => 1,
            Self::InvalidApduInThisState => 2,
            Self::PreemptedByHigherPriorityTask => 3,
            Self::SegmentationNotSupported => 4,
            Self::SecurityError => 5,
            Self::InsufficientSecurity => 6,
            Self::WindowSizeOutOfRange => 7,
            Self::ApplicationExceededReplyTime => 8,
            Self::OutOfResources => 9,
            Self::TsmTimeout => 10,
            Self::ApduTooLong => 11,
            Self::ServerTimeout => 64,
            Self::NoResponse => 65,
            Self::Proprietary(value) => value,
        }
    }
}

/// BACnet-Confirmed-Request-PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRequest {
    /// This PDU is one segment of a larger message.
    pub segmented: bool,
    /// More segments follow this one.
    pub more_follows: bool,
    /// The requester can receive a segmented response.
    pub segmented_response_accepted: bool,
    /// Maximum response segments the requester accepts; `None` if unspecified.
    pub max_segments_accepted: Option<u8>,
    /// Maximum APDU size the requester accepts.
    pub max_apdu_length_accepted: u16,
    /// Invoke ID; left empty by the application to have one allocated.
    pub invoke_id: Option<u8>,
    /// Segment sequence number.
    pub sequence_number: u8,
    /// Proposed window size.
    pub window_size: u8,
    /// Confirmed service choice.
    pub service_choice: u8,
    /// Encoded service parameters.
    pub data: Bytes,
}

impl ConfirmedRequest {
    /// An unsegmented request with no invoke ID assigned yet.
    pub fn new(service_choice: u8, data: impl Into<Bytes>) -> Self {
        Self {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: false,
            max_segments_accepted: None,
            max_apdu_length_accepted: 1476,
            invoke_id: None,
            sequence_number: 0,
            window_size: 0,
            service_choice,
            data: data.into(),
        }
    }
}

/// BACnet-Unconfirmed-Request-PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedRequest {
    pub service_choice: u8,
    pub data: Bytes,
}

/// BACnet-SimpleACK-PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleAck {
    pub invoke_id: u8,
    pub service_choice: u8,
}

/// BACnet-ComplexACK-PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexAck {
    pub segmented: bool,
    pub more_follows: bool,
    pub invoke_id: u8,
    pub sequence_number: u8,
    /// Proposed window size.
    pub window_size: u8,
    pub service_choice: u8,
    pub data: Bytes,
}

impl ComplexAck {
    /// An unsegmented acknowledgement.
    pub fn new(invoke_id: u8, service_choice: u8, data: impl Into<Bytes>) -> Self {
        Self {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: 0,
            window_size: 0,
            service_choice,
            data: data.into(),
        }
    }
}

/// BACnet-Error-PDU. Error class and code stay encoded in `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPdu {
    pub invoke_id: u8,
    pub service_choice: u8,
    pub data: Bytes,
}

/// BACnet-Reject-PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    pub invoke_id: u8,
    pub reason: u8,
}

/// BACnet-Abort-PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    /// Sent by the server side of the transaction.
    pub server: bool,
    pub invoke_id: u8,
    pub reason: AbortReason,
}

/// BACnet-SegmentACK-PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Segment received out of order.
    pub negative: bool,
    /// Sent by the server side of the transaction.
    pub server: bool,
    pub invoke_id: u8,
    /// Last segment received in order.
    pub sequence_number: u8,
    /// Actual window size.
    pub window_size: u8,
}

/// One decoded APDU of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    ConfirmedRequest(ConfirmedRequest),
    UnconfirmedRequest(UnconfirmedRequest),
    SimpleAck(SimpleAck),
    ComplexAck(ComplexAck),
    Error(ErrorPdu),
    Reject(Reject),
    Abort(Abort),
    SegmentAck(SegmentAck),
}

impl Pdu {
    /// Human readable kind, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::ConfirmedRequest(_) => "ConfirmedRequest",
            Pdu::UnconfirmedRequest(_) => "UnconfirmedRequest",
            Pdu::SimpleAck(_) => "SimpleAck",
            Pdu::ComplexAck(_) => "ComplexAck",
            Pdu::Error(_) => "Error",
            Pdu::Reject(_) => "Reject",
            Pdu::Abort(_) => "Abort",
            Pdu::SegmentAck(_) => "SegmentAck",
        }
    }

    /// Invoke ID of the transaction this PDU belongs to.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Pdu::ConfirmedRequest(pdu) => pdu.invoke_id,
            Pdu::UnconfirmedRequest(_) => None,
            Pdu::SimpleAck(pdu) => Some(pdu.invoke_id),
            Pdu::ComplexAck(pdu) => Some(pdu.invoke_id),
            Pdu::Error(pdu) => Some(pdu.invoke_id),
            Pdu::Reject(pdu) => Some(pdu.invoke_id),
            Pdu::Abort(pdu) => Some(pdu.invoke_id),
            Pdu::SegmentAck(pdu) => Some(pdu.invoke_id),
        }
    }

    /// Service choice, for the kinds that carry one.
    pub fn service_choice(&self) -> Option<u8> {
        match self {
            Pdu::ConfirmedRequest(pdu) => Some(pdu.service_choice),
            Pdu::UnconfirmedRequest(pdu) => Some(pdu.service_choice),
            Pdu::SimpleAck(pdu) => Some(pdu.service_choice),
            Pdu::ComplexAck(pdu) => Some(pdu.service_choice),
            Pdu::Error(pdu) => Some(pdu.service_choice),
            Pdu::Reject(_) | Pdu::Abort(_) | Pdu::SegmentAck(_) => None,
        }
    }
}

macro_rules! impl_from_pdu {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Pdu {
                fn from(pdu: $ty) -> Self {
                    Pdu::$variant(pdu)
                }
            }
        )*
    };
}

impl_from_pdu! {
    ConfirmedRequest => ConfirmedRequest,
    UnconfirmedRequest => UnconfirmedRequest,
    SimpleAck => SimpleAck,
    ComplexAck => ComplexAck,
    ErrorPdu => Error,
    Reject => Reject,
    Abort => Abort,
    SegmentAck => SegmentAck,
}

/// An APDU together with the address of the remote device.
///
/// For inbound traffic `peer` is the source, for outbound traffic it is the
/// destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub peer: Address,
    pub pdu: Pdu,
}

impl Apdu {
    pub fn new(peer: Address, pdu: impl Into<Pdu>) -> Self {
        Self {
            peer,
            pdu: pdu.into(),
        }
    }
}
