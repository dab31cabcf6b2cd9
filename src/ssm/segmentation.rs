//! Segmentation, reassembly and windowing shared by both roles.
//!
//! A message that does not fit in one APDU is cut into `segment_size` slices
//! of a single buffer (the segmentation context). Segment `i` is rebuilt on
//! demand from that buffer, so a resent window is byte-for-byte the window
//! sent before. Sequence numbers are the segment index modulo 256; messages
//! are limited to [`MAX_SEGMENTS`] segments so the two never diverge.

use bytes::{Bytes, BytesMut};
use log::{trace, warn};

use super::{Context, Ssm};
use crate::apdu::{ComplexAck, ConfirmedRequest, Pdu, SegmentAck};
use crate::config::MAX_WINDOW_SIZE;
use crate::error::{Result, TsmError};

/// Largest number of segments one message may be cut into.
pub const MAX_SEGMENTS: usize = 256;

/// Sliding window membership: is `seq_a` within `window` of `seq_b`?
///
/// Equivalent to `((a - b + 256) % 256) < window`.
///
/// # Examples
///
/// ```
/// use bacnet_tsm::ssm::in_window;
///
/// assert!(in_window(5, 4, 2));
/// assert!(!in_window(6, 4, 2));
/// assert!(in_window(1, 255, 3));
/// assert!(!in_window(3, 4, 2));
/// ```
pub fn in_window(seq_a: u8, seq_b: u8, window: u8) -> bool {
    seq_a.wrapping_sub(seq_b) < window
}

/// Number of segments needed for `length` bytes; always at least one.
pub fn segment_count(length: usize, segment_size: usize) -> usize {
    if length == 0 {
        1
    } else {
        length.div_ceil(segment_size.max(1))
    }
}

/// The message being split or reassembled.
#[derive(Debug)]
pub(crate) struct SegmentationContext {
    header: Pdu,
    buffer: BytesMut,
}

impl SegmentationContext {
    fn new(pdu: Pdu) -> Option<Self> {
        let (header, data) = match pdu {
            Pdu::ConfirmedRequest(mut request) => {
                let data = std::mem::take(&mut request.data);
                (Pdu::ConfirmedRequest(request), data)
            }
            Pdu::ComplexAck(mut ack) => {
                let data = std::mem::take(&mut ack.data);
                (Pdu::ComplexAck(ack), data)
            }
            _ => return None,
        };
        Some(Self {
            header,
            buffer: BytesMut::from(&data[..]),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// What a received segment did to the reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Reassembly {
    /// Not the next expected segment; the buffer is unchanged.
    OutOfOrder,
    /// Appended; more segments follow.
    InProgress,
    /// Appended the final segment.
    Complete,
    /// More segments than this device accepts.
    Overflow,
}

/// What a received SegmentAck did to the transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Acknowledged {
    /// Outside the window: duplicate or late.
    Duplicate,
    /// The next window was sent.
    WindowSent,
    /// The last segment was acknowledged.
    Final,
}

impl Ssm {
    /// Record the message to split or reassemble.
    pub fn set_segmentation_context(&mut self, pdu: Pdu) -> Result<()> {
        let kind = pdu.kind();
        let context = SegmentationContext::new(pdu).ok_or(TsmError::InvalidApdu {
            state: self.state,
            kind,
        })?;
        self.context = Some(context);
        Ok(())
    }

    /// Size the segmentation of the current context for `max_length` byte segments.
    pub(super) fn compute_segmentation(&mut self, max_length: usize) -> Result<()> {
        let length = self
            .context
            .as_ref()
            .ok_or(TsmError::NoSegmentationContext)?
            .len();
        self.segment_size = max_length.max(1);
        self.segment_count = segment_count(length, self.segment_size);
        trace!(
            "Transaction {}: {} bytes in {} segments of {}",
            self.invoke_id,
            length,
            self.segment_count,
            self.segment_size
        );
        Ok(())
    }

    /// Rebuild segment `index` of the current context.
    pub fn get_segment(&self, index: usize) -> Result<Pdu> {
        let context = self.context.as_ref().ok_or(TsmError::NoSegmentationContext)?;
        if index >= self.segment_count {
            return Err(TsmError::InvalidSegment {
                index,
                count: self.segment_count,
            });
        }

        let offset = (index * self.segment_size).min(context.len());
        let end = (offset + self.segment_size).min(context.len());
        let data = Bytes::copy_from_slice(&context.buffer[offset..end]);

        let segmented = self.segment_count != 1;
        let more_follows = segmented && index < self.segment_count - 1;
        let sequence_number = if segmented { (index % 256) as u8 } else { 0 };
        let window_size = if segmented {
            self.config.proposed_window_size
        } else {
            0
        };

        let pdu = match &context.header {
            Pdu::ConfirmedRequest(header) => Pdu::ConfirmedRequest(ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted: self.config.segmentation_supported.can_receive(),
                max_segments_accepted: self.config.max_segments_accepted,
                max_apdu_length_accepted: self.config.max_apdu_length_accepted as u16,
                invoke_id: Some(self.invoke_id),
                sequence_number,
                window_size,
                service_choice: header.service_choice,
                data,
            }),
            Pdu::ComplexAck(header) => Pdu::ComplexAck(ComplexAck {
                segmented,
                more_follows,
                invoke_id: self.invoke_id,
                sequence_number,
                window_size,
                service_choice: header.service_choice,
                data,
            }),
            other => {
                return Err(TsmError::InvalidApdu {
                    state: self.state,
                    kind: other.kind(),
                })
            }
        };
        Ok(pdu)
    }

    /// Append the payload of an in-order segment to the reassembly buffer.
    pub fn append_segment(&mut self, data: &[u8]) -> Result<()> {
        let context = self.context.as_mut().ok_or(TsmError::NoSegmentationContext)?;
        context.buffer.extend_from_slice(data);
        Ok(())
    }

    /// The reassembled message, as if it had arrived unsegmented.
    pub(super) fn reassembled(&self) -> Result<Pdu> {
        let context = self.context.as_ref().ok_or(TsmError::NoSegmentationContext)?;
        let data = Bytes::copy_from_slice(&context.buffer);
        let pdu = match &context.header {
            Pdu::ConfirmedRequest(header) => Pdu::ConfirmedRequest(ConfirmedRequest {
                segmented: false,
                more_follows: false,
                sequence_number: 0,
                window_size: 0,
                data,
                ..header.clone()
            }),
            Pdu::ComplexAck(header) => Pdu::ComplexAck(ComplexAck {
                segmented: false,
                more_follows: false,
                sequence_number: 0,
                window_size: 0,
                data,
                ..header.clone()
            }),
            other => {
                return Err(TsmError::InvalidApdu {
                    state: self.state,
                    kind: other.kind(),
                })
            }
        };
        Ok(pdu)
    }

    /// Sliding window test against the actual window size.
    pub fn in_window(&self, seq_a: u8, seq_b: u8) -> bool {
        in_window(seq_a, seq_b, self.actual_window_size)
    }

    /// Send up to one window of segments starting at `sequence_number`.
    ///
    /// Stops after the segment without more-follows and marks the message as
    /// fully sent.
    pub(super) fn fill_window(&mut self, sequence_number: u8, cx: &mut Context<'_>) -> Result<()> {
        for offset in 0..self.actual_window_size as usize {
            let index = sequence_number as usize + offset;
            if index >= self.segment_count {
                break;
            }

            let segment = self.get_segment(index)?;
            let more_follows = match &segment {
                Pdu::ConfirmedRequest(request) => request.more_follows,
                Pdu::ComplexAck(ack) => ack.more_follows,
                _ => false,
            };
            trace!(
                "Transaction {}: segment {} to {} (more_follows={})",
                self.invoke_id,
                index,
                self.peer,
                more_follows
            );
            self.to_network(segment, cx);

            if !more_follows {
                self.sent_all_segments = true;
                break;
            }
        }
        Ok(())
    }

    /// Start sending the segments of the current context.
    pub(super) fn begin_transmit(&mut self) {
        self.sent_all_segments = self.segment_count == 1;
        self.segment_retry_count = 0;
        self.initial_sequence_number = 0;
        // Only segment 0 is outstanding until the peer grants a window
        self.actual_window_size = 1;
    }

    /// Apply a SegmentAck received while sending a segmented message.
    pub(super) fn segment_acknowledged(
        &mut self,
        ack: &SegmentAck,
        cx: &mut Context<'_>,
    ) -> Result<Acknowledged> {
        if !self.in_window(ack.sequence_number, self.initial_sequence_number) {
            trace!(
                "Transaction {}: duplicate SegmentAck seq={}",
                self.invoke_id,
                ack.sequence_number
            );
            self.restart_timer(self.config.segment_timeout, cx.now);
            return Ok(Acknowledged::Duplicate);
        }

        let last_segment = ((self.segment_count - 1) % 256) as u8;
        if self.sent_all_segments && ack.sequence_number == last_segment {
            return Ok(Acknowledged::Final);
        }

        self.initial_sequence_number = ack.sequence_number.wrapping_add(1);
        self.actual_window_size = ack.window_size.clamp(1, MAX_WINDOW_SIZE);
        self.segment_retry_count = 0;
        self.fill_window(self.initial_sequence_number, cx)?;
        self.restart_timer(self.config.segment_timeout, cx.now);
        Ok(Acknowledged::WindowSent)
    }

    /// Resend the current window after a segment timeout.
    ///
    /// Returns false once the segment retry budget is spent.
    pub(super) fn resend_window(&mut self, cx: &mut Context<'_>) -> Result<bool> {
        if self.segment_retry_count >= self.config.number_of_apdu_retries {
            return Ok(false);
        }
        self.segment_retry_count += 1;
        warn!(
            "Transaction {} with {}: resending window at seq {} (retry {}/{})",
            self.invoke_id,
            self.peer,
            self.initial_sequence_number,
            self.segment_retry_count,
            self.config.number_of_apdu_retries
        );
        self.restart_timer(self.config.segment_timeout, cx.now);
        self.fill_window(self.initial_sequence_number, cx)?;
        Ok(true)
    }

    /// Start reassembling a segmented message whose first segment is `pdu`.
    ///
    /// The window is the smaller of the sender's proposal and ours.
    pub(super) fn begin_receive(&mut self, pdu: Pdu, proposed_window_size: u8) -> Result<()> {
        self.set_segmentation_context(pdu)?;
        self.actual_window_size = proposed_window_size
            .min(self.config.proposed_window_size)
            .max(1);
        self.segments_received = 1;
        self.initial_sequence_number = 0;
        self.last_sequence_number = 0;
        Ok(())
    }

    /// Apply one inbound segment to the reassembly.
    pub(super) fn segment_received(
        &mut self,
        sequence_number: u8,
        more_follows: bool,
        data: &[u8],
        cx: &mut Context<'_>,
    ) -> Result<Reassembly> {
        if sequence_number != self.last_sequence_number.wrapping_add(1) {
            trace!(
                "Transaction {}: segment {} out of order, expected {}",
                self.invoke_id,
                sequence_number,
                self.last_sequence_number.wrapping_add(1)
            );
            self.restart_timer(self.config.segment_timeout, cx.now);
            self.send_segment_ack(true, self.last_sequence_number, cx);
            return Ok(Reassembly::OutOfOrder);
        }

        let limit = self
            .config
            .max_segments_accepted
            .map_or(MAX_SEGMENTS, usize::from);
        if self.segments_received >= limit {
            return Ok(Reassembly::Overflow);
        }

        self.append_segment(data)?;
        self.segments_received += 1;
        self.last_sequence_number = sequence_number;

        if !more_follows {
            self.send_segment_ack(false, self.last_sequence_number, cx);
            return Ok(Reassembly::Complete);
        }

        if sequence_number
            == self
                .initial_sequence_number
                .wrapping_add(self.actual_window_size)
        {
            self.initial_sequence_number = self.last_sequence_number;
            self.send_segment_ack(false, self.last_sequence_number, cx);
        }
        self.restart_timer(self.config.segment_timeout, cx.now);
        Ok(Reassembly::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::config::TsmConfig;
    use crate::ssm::{Effect, Role};
    use proptest::prelude::*;
    use std::time::Instant;

    fn sender(payload: Vec<u8>, segment_size: usize) -> Ssm {
        let mut ssm = Ssm::new(
            Role::Server,
            Address::LocalStation(vec![7]),
            3,
            TsmConfig::default(),
            None,
        );
        ssm.set_segmentation_context(Pdu::ComplexAck(ComplexAck::new(3, 12, payload)))
            .unwrap();
        ssm.compute_segmentation(segment_size).unwrap();
        ssm
    }

    fn payload_of(pdu: &Pdu) -> &[u8] {
        match pdu {
            Pdu::ComplexAck(ack) => &ack.data,
            Pdu::ConfirmedRequest(request) => &request.data,
            _ => panic!("not a segment"),
        }
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(0, 50), 1);
        assert_eq!(segment_count(50, 50), 1);
        assert_eq!(segment_count(51, 50), 2);
        assert_eq!(segment_count(130, 50), 3);
    }

    #[test]
    fn test_get_segment_slices() {
        let payload: Vec<u8> = (0..130).collect();
        let ssm = sender(payload.clone(), 50);
        assert_eq!(ssm.segment_count(), 3);

        let sizes: Vec<usize> = (0..3)
            .map(|i| payload_of(&ssm.get_segment(i).unwrap()).len())
            .collect();
        assert_eq!(sizes, vec![50, 50, 30]);

        match ssm.get_segment(2).unwrap() {
            Pdu::ComplexAck(ack) => {
                assert!(ack.segmented);
                assert!(!ack.more_follows);
                assert_eq!(ack.sequence_number, 2);
                assert_eq!(ack.window_size, 2);
                assert_eq!(&ack.data[..], &payload[100..]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match ssm.get_segment(0).unwrap() {
            Pdu::ComplexAck(ack) => assert!(ack.more_follows),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_get_segment_errors() {
        let ssm = sender(vec![1, 2, 3], 50);
        assert_eq!(
            ssm.get_segment(1),
            Err(TsmError::InvalidSegment { index: 1, count: 1 })
        );

        let empty = Ssm::new(
            Role::Client,
            Address::LocalStation(vec![1]),
            0,
            TsmConfig::default(),
            None,
        );
        assert_eq!(empty.get_segment(0), Err(TsmError::NoSegmentationContext));
    }

    #[test]
    fn test_unsegmented_message() {
        let ssm = sender(vec![9; 10], 50);
        match ssm.get_segment(0).unwrap() {
            Pdu::ComplexAck(ack) => {
                assert!(!ack.segmented);
                assert!(!ack.more_follows);
                assert_eq!(ack.data.len(), 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_payload_is_one_segment() {
        let ssm = sender(Vec::new(), 50);
        assert_eq!(ssm.segment_count(), 1);
        assert!(payload_of(&ssm.get_segment(0).unwrap()).is_empty());
    }

    #[test]
    fn test_fill_window_stops_at_last_segment() {
        let mut ssm = sender(vec![0; 130], 50);
        ssm.begin_transmit();
        ssm.actual_window_size = 5;

        let mut effects = Vec::new();
        let mut cx = Context::new(Instant::now(), &mut effects);
        ssm.fill_window(1, &mut cx).unwrap();

        assert_eq!(effects.len(), 2);
        assert!(ssm.sent_all_segments());
    }

    #[test]
    fn test_fill_window_respects_window() {
        let mut ssm = sender(vec![0; 500], 50);
        ssm.begin_transmit();
        ssm.actual_window_size = 3;

        let mut effects = Vec::new();
        let mut cx = Context::new(Instant::now(), &mut effects);
        ssm.fill_window(2, &mut cx).unwrap();

        let sequences: Vec<u8> = effects
            .iter()
            .map(|effect| match effect {
                Effect::Request(apdu) => match &apdu.pdu {
                    Pdu::ComplexAck(ack) => ack.sequence_number,
                    other => panic!("unexpected {:?}", other),
                },
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sequences, vec![2, 3, 4]);
        assert!(!ssm.sent_all_segments());
    }

    proptest! {
        #[test]
        fn prop_in_window_matches_modular_distance(a in any::<u8>(), b in any::<u8>(), w in 1u8..=128) {
            let distance = (a as i32 - b as i32 + 256) % 256;
            prop_assert_eq!(in_window(a, b, w), distance < w as i32);
        }

        #[test]
        fn prop_split_and_reassemble(payload in proptest::collection::vec(any::<u8>(), 0..2000), size in 1usize..300) {
            let ssm = sender(payload.clone(), size);
            let count = ssm.segment_count();
            prop_assert_eq!(count, segment_count(payload.len(), size));

            let mut receiver = Ssm::new(
                Role::Client,
                Address::LocalStation(vec![7]),
                3,
                TsmConfig::default(),
                None,
            );
            let first = ssm.get_segment(0).unwrap();
            receiver.set_segmentation_context(first).unwrap();
            for index in 1..count {
                let segment = ssm.get_segment(index).unwrap();
                receiver.append_segment(payload_of(&segment)).unwrap();
            }

            let rebuilt = receiver.reassembled().unwrap();
            prop_assert_eq!(payload_of(&rebuilt), &payload[..]);
        }
    }
}
