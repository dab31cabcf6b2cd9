//! Transaction layer configuration.
//!
//! The values normally come from the local Device object (APDU_Timeout,
//! Number_Of_APDU_Retries, Max_APDU_Length_Accepted, Segmentation_Supported,
//! APDU_Segment_Timeout, Max_Segments_Accepted). With the `serde` feature the
//! configuration can be loaded from any serde format.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::apdu::Segmentation;
use crate::error::{Result, TsmError};

/// Default APDU timeout (3 seconds)
pub const DEFAULT_APDU_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default segment timeout (1.5 seconds)
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_millis(1500);

/// How long a server transaction waits for the local application to answer.
pub const APPLICATION_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default message-level retry budget
pub const DEFAULT_APDU_RETRIES: u8 = 3;

/// Default maximum APDU length accepted
pub const DEFAULT_MAX_APDU_LENGTH: usize = 1024;

/// Smallest max-APDU value defined by the standard
pub const MIN_MAX_APDU_LENGTH: usize = 50;

/// Largest max-APDU value defined by the standard (BACnet/IP)
pub const MAX_MAX_APDU_LENGTH: usize = 1476;

/// Largest window a segmented transfer may negotiate
pub const MAX_WINDOW_SIZE: u8 = 127;

/// Transaction state machine settings
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TsmConfig {
    /// Message-level and segment-level retry budget
    pub number_of_apdu_retries: u8,
    /// Wait for the answer to an unsegmented request
    pub apdu_timeout: Duration,
    /// Wait between segments or for a segment acknowledgement
    pub segment_timeout: Duration,
    /// Ceiling on the size of any APDU this device sends or accepts
    pub max_apdu_length_accepted: usize,
    /// Which directions may be segmented
    pub segmentation_supported: Segmentation,
    /// Ceiling on the number of segments in an inbound message; `None` if unspecified
    pub max_segments_accepted: Option<u8>,
    /// Window size offered when starting a segmented transfer
    pub proposed_window_size: u8,
    #[cfg_attr(feature = "serde", serde(skip, default = "application_timeout_default"))]
    application_timeout: Duration,
}

#[cfg(feature = "serde")]
fn application_timeout_default() -> Duration {
    APPLICATION_TIMEOUT
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            number_of_apdu_retries: DEFAULT_APDU_RETRIES,
            apdu_timeout: DEFAULT_APDU_TIMEOUT,
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
            max_apdu_length_accepted: DEFAULT_MAX_APDU_LENGTH,
            segmentation_supported: Segmentation::None,
            max_segments_accepted: Some(8),
            proposed_window_size: 2,
            application_timeout: APPLICATION_TIMEOUT,
        }
    }
}

impl TsmConfig {
    pub fn with_apdu_retries(mut self, retries: u8) -> Self {
        self.number_of_apdu_retries = retries;
        self
    }

    pub fn with_apdu_timeout(mut self, timeout: Duration) -> Self {
        self.apdu_timeout = timeout;
        self
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn with_max_apdu_length(mut self, length: usize) -> Self {
        self.max_apdu_length_accepted = length;
        self
    }

    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation_supported = segmentation;
        self
    }

    pub fn with_max_segments(mut self, max_segments: Option<u8>) -> Self {
        self.max_segments_accepted = max_segments;
        self
    }

    pub fn with_proposed_window_size(mut self, window_size: u8) -> Self {
        self.proposed_window_size = window_size;
        self
    }

    /// How long the application may take to answer a confirmed request.
    ///
    /// Fixed at [`APPLICATION_TIMEOUT`].
    pub fn application_timeout(&self) -> Duration {
        self.application_timeout
    }

    /// Check that the settings describe a usable transaction layer.
    pub fn validate(&self) -> Result<()> {
        if self.proposed_window_size == 0 || self.proposed_window_size > MAX_WINDOW_SIZE {
            return Err(TsmError::InvalidConfig(format!(
                "proposed window size {} outside 1..={}",
                self.proposed_window_size, MAX_WINDOW_SIZE
            )));
        }
        if !(MIN_MAX_APDU_LENGTH..=MAX_MAX_APDU_LENGTH).contains(&self.max_apdu_length_accepted) {
            return Err(TsmError::InvalidConfig(format!(
                "max APDU length {} outside {}..={}",
                self.max_apdu_length_accepted, MIN_MAX_APDU_LENGTH, MAX_MAX_APDU_LENGTH
            )));
        }
        if self.apdu_timeout.is_zero() || self.segment_timeout.is_zero() {
            return Err(TsmError::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if self.max_segments_accepted == Some(0) {
            return Err(TsmError::InvalidConfig(
                "max segments accepted must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
