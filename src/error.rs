//! Error types for the transaction layer.
//!
//! Only invariant violations and caller mistakes are reported through
//! [`TsmError`]. Network conditions (lost segments, silent peers, capability
//! mismatches) never surface here; they terminate the affected transaction
//! with an Abort APDU instead.

use thiserror::Error;

use crate::address::Address;
use crate::ssm::State;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, TsmError>;

/// Errors raised by the segmentation state machines and the transaction
/// manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TsmError {
    /// A transaction in a terminal state was asked to change state.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State the transaction was in.
        from: State,
        /// State that was requested.
        to: State,
    },

    /// An APDU kind that the current state can never legally see.
    #[error("invalid APDU {kind} in state {state:?}")]
    InvalidApdu {
        /// State the transaction was in.
        state: State,
        /// Kind of the offending APDU.
        kind: &'static str,
    },

    /// A segment was requested before a segmentation context was set.
    #[error("no segmentation context established")]
    NoSegmentationContext,

    /// A segment index outside of the message was requested.
    #[error("invalid segment number {index}, message has {count} segments")]
    InvalidSegment {
        /// Requested segment index.
        index: usize,
        /// Number of segments in the message.
        count: usize,
    },

    /// Every invoke ID is bound to an active transaction for this peer.
    #[error("no available invoke ID for {0}")]
    InvokeIdExhausted(Address),

    /// The application supplied an invoke ID that is already in use.
    #[error("invoke ID {invoke_id} already in use for {address}")]
    InvokeIdInUse {
        /// The conflicting invoke ID.
        invoke_id: u8,
        /// Peer the transaction is bound to.
        address: Address,
    },

    /// An APDU that carries no invoke ID where one is required.
    #[error("APDU without invoke ID")]
    MissingInvokeId,

    /// The transaction manager has no route for this APDU kind in this direction.
    #[error("cannot dispatch {0} APDU")]
    UnroutableApdu(&'static str),

    /// A confirmed request was addressed to a broadcast destination.
    #[error("confirmed request to {0} is not a station address")]
    NotAStation(Address),

    /// A device information record was released more often than acquired.
    #[error("device info reference count underflow for {0}")]
    ReferenceCount(Address),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A device information snapshot could not be encoded or decoded.
    #[cfg(feature = "serde")]
    #[error("device info persistence failed: {0}")]
    Persistence(String),

    /// The async driver has stopped and no longer accepts commands.
    #[cfg(feature = "async")]
    #[error("transaction driver closed")]
    DriverClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TsmError::InvalidTransition {
            from: State::Completed,
            to: State::AwaitConfirmation,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from Completed to AwaitConfirmation"
        );

        let err = TsmError::InvalidSegment { index: 3, count: 3 };
        assert_eq!(err.to_string(), "invalid segment number 3, message has 3 segments");

        let err = TsmError::InvokeIdExhausted(Address::LocalStation(vec![0x0A]));
        assert_eq!(err.to_string(), "no available invoke ID for 0a");
    }
}
