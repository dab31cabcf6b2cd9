//! Client role: a confirmed request this device originates.
//!
//! ```text
//! IDLE --request--> AWAIT_CONFIRMATION --ack/error/reject--> COMPLETED
//!   |                   ^        |
//!   |   final SegAck    |        +--segmented ComplexAck--> SEGMENTED_CONFIRMATION --last--> COMPLETED
//!   +--> SEGMENTED_REQUEST
//! ```

use log::{debug, warn};

use super::segmentation::{Acknowledged, Reassembly};
use super::{Context, Event, Ssm, State, MAX_SEGMENTS};
use crate::apdu::{AbortReason, Apdu, Pdu};
use crate::error::Result;

impl Ssm {
    pub(super) fn client_event(&mut self, event: Event, cx: &mut Context<'_>) -> Result<()> {
        match event {
            Event::Indication(apdu) => self.client_indication(apdu, cx),
            Event::Confirmation(apdu) => match self.state {
                State::SegmentedRequest => self.segmented_request(apdu.pdu, cx),
                State::AwaitConfirmation => self.await_confirmation(apdu.pdu, cx),
                State::SegmentedConfirmation => self.segmented_confirmation(apdu.pdu, cx),
                _ => Err(self.invalid(&apdu.pdu)),
            },
            Event::Timeout => self.client_timeout(cx),
        }
    }

    /// The application hands over the request.
    fn client_indication(&mut self, apdu: Apdu, cx: &mut Context<'_>) -> Result<()> {
        if self.state != State::Idle || !matches!(apdu.pdu, Pdu::ConfirmedRequest(_)) {
            return Err(self.invalid(&apdu.pdu));
        }
        self.set_segmentation_context(apdu.pdu)?;
        self.retry_count = 0;
        self.send_request(cx)
    }

    /// Send the request from the segmentation context, from the beginning.
    ///
    /// Also the retry path: each attempt is rebuilt from the cached message.
    fn send_request(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let mut max_length = self.config.max_apdu_length_accepted;
        if let Some(info) = &self.device_info {
            max_length = max_length.min(info.max_deliverable_length());
        }
        self.compute_segmentation(max_length)?;

        if self.segment_count > 1 {
            if let Some(reason) = self.request_segmentation_refused() {
                return self.abort_to(reason, false, true, cx);
            }
        }

        self.begin_transmit();
        if self.segment_count == 1 {
            self.set_state(State::AwaitConfirmation, Some(self.config.apdu_timeout), cx.now)?;
        } else {
            self.set_state(State::SegmentedRequest, Some(self.config.segment_timeout), cx.now)?;
        }

        let segment = self.get_segment(0)?;
        self.to_network(segment, cx);
        Ok(())
    }

    fn request_segmentation_refused(&self) -> Option<AbortReason> {
        if !self.config.segmentation_supported.can_transmit() {
            return Some(AbortReason::SegmentationNotSupported);
        }
        // Without a record the peer is assumed unable to reassemble
        let info = match &self.device_info {
            Some(info) => info,
            None => return Some(AbortReason::SegmentationNotSupported),
        };
        if !info.segmentation_supported.can_receive() {
            return Some(AbortReason::SegmentationNotSupported);
        }
        if self.segment_count > MAX_SEGMENTS {
            return Some(AbortReason::ApduTooLong);
        }
        match info.max_segments_accepted {
            Some(max) if self.segment_count > usize::from(max) => Some(AbortReason::ApduTooLong),
            _ => None,
        }
    }

    fn segmented_request(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        match pdu {
            Pdu::SegmentAck(ack) => {
                if self.segment_acknowledged(&ack, cx)? == Acknowledged::Final {
                    self.set_state(State::AwaitConfirmation, Some(self.config.apdu_timeout), cx.now)?;
                }
                Ok(())
            }
            Pdu::Abort(abort) => {
                self.set_state(State::Aborted, None, cx.now)?;
                self.to_application(abort, cx);
                Ok(())
            }
            Pdu::SimpleAck(_) | Pdu::ComplexAck(_) | Pdu::Error(_) | Pdu::Reject(_) => {
                if self.sent_all_segments {
                    // Final SegmentAck lost, the answer implies it
                    self.await_confirmation(pdu, cx)
                } else {
                    self.abort_to(AbortReason::InvalidApduInThisState, true, true, cx)
                }
            }
            other => Err(self.invalid(&other)),
        }
    }

    fn await_confirmation(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        match pdu {
            Pdu::Abort(abort) => {
                self.set_state(State::Aborted, None, cx.now)?;
                self.to_application(abort, cx);
                Ok(())
            }
            Pdu::SimpleAck(_) | Pdu::Error(_) | Pdu::Reject(_) => {
                self.set_state(State::Completed, None, cx.now)?;
                self.to_application(pdu, cx);
                Ok(())
            }
            Pdu::ComplexAck(ack) if !ack.segmented => {
                self.set_state(State::Completed, None, cx.now)?;
                self.to_application(ack, cx);
                Ok(())
            }
            Pdu::ComplexAck(ack) => {
                if !self.config.segmentation_supported.can_receive() {
                    return self.abort_to(AbortReason::SegmentationNotSupported, true, true, cx);
                }
                if ack.sequence_number != 0 {
                    return self.abort_to(AbortReason::InvalidApduInThisState, true, true, cx);
                }

                let window_size = ack.window_size;
                let more_follows = ack.more_follows;
                self.begin_receive(Pdu::ComplexAck(ack), window_size)?;
                self.send_segment_ack(false, 0, cx);

                if more_follows {
                    self.set_state(
                        State::SegmentedConfirmation,
                        Some(self.config.segment_timeout),
                        cx.now,
                    )
                } else {
                    self.set_state(State::Completed, None, cx.now)?;
                    let response = self.reassembled()?;
                    self.to_application(response, cx);
                    Ok(())
                }
            }
            Pdu::SegmentAck(ack) => {
                debug!(
                    "Transaction {}: late SegmentAck seq={} ignored",
                    self.invoke_id, ack.sequence_number
                );
                Ok(())
            }
            other => Err(self.invalid(&other)),
        }
    }

    fn segmented_confirmation(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        match pdu {
            Pdu::Abort(abort) => {
                self.set_state(State::Aborted, None, cx.now)?;
                self.to_application(abort, cx);
                Ok(())
            }
            Pdu::ComplexAck(ack) if ack.segmented => {
                match self.segment_received(ack.sequence_number, ack.more_follows, &ack.data, cx)? {
                    Reassembly::Complete => {
                        self.set_state(State::Completed, None, cx.now)?;
                        let response = self.reassembled()?;
                        self.to_application(response, cx);
                        Ok(())
                    }
                    Reassembly::Overflow => {
                        self.abort_to(AbortReason::BufferOverflow, true, true, cx)
                    }
                    Reassembly::InProgress | Reassembly::OutOfOrder => Ok(()),
                }
            }
            _ => self.abort_to(AbortReason::InvalidApduInThisState, true, true, cx),
        }
    }

    fn client_timeout(&mut self, cx: &mut Context<'_>) -> Result<()> {
        match self.state {
            State::SegmentedRequest => {
                if !self.resend_window(cx)? {
                    self.abort_to(AbortReason::NoResponse, false, true, cx)?;
                }
                Ok(())
            }
            State::AwaitConfirmation => {
                if self.retry_count < self.config.number_of_apdu_retries {
                    self.retry_count += 1;
                    warn!(
                        "Transaction {} with {}: no answer, retry {}/{}",
                        self.invoke_id, self.peer, self.retry_count, self.config.number_of_apdu_retries
                    );
                    self.send_request(cx)
                } else {
                    self.abort_to(AbortReason::NoResponse, false, true, cx)
                }
            }
            State::SegmentedConfirmation => self.abort_to(AbortReason::NoResponse, false, true, cx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use crate::address::Address;
    use crate::apdu::{Abort, ComplexAck, ConfirmedRequest, Segmentation, SegmentAck, SimpleAck};
    use crate::config::TsmConfig;
    use crate::device_info::DeviceInfo;
    use crate::ssm::{Context, Effect, Event, Role, Ssm, State};

    use super::*;

    fn peer() -> Address {
        Address::LocalStation(vec![0x0a, 0x00, 0x00, 0x02, 0xba, 0xc0])
    }

    fn segmenting_peer(max_apdu: usize) -> DeviceInfo {
        let mut info = DeviceInfo::new(peer());
        info.max_apdu_length_accepted = max_apdu;
        info.segmentation_supported = Segmentation::Both;
        info
    }

    fn client(config: TsmConfig, info: Option<DeviceInfo>) -> Ssm {
        Ssm::new(Role::Client, peer(), 1, config, info)
    }

    fn request(len: usize) -> Event {
        let mut request = ConfirmedRequest::new(12, vec![0x55; len]);
        request.invoke_id = Some(1);
        Event::Indication(Apdu::new(peer(), request))
    }

    fn reply(pdu: impl Into<Pdu>) -> Event {
        Event::Confirmation(Apdu::new(peer(), pdu))
    }

    fn step(ssm: &mut Ssm, event: Event, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        ssm.handle(event, &mut Context::new(now, &mut effects)).unwrap();
        effects
    }

    fn segment_ack(seq: u8, window: u8) -> SegmentAck {
        SegmentAck {
            negative: false,
            server: true,
            invoke_id: 1,
            sequence_number: seq,
            window_size: window,
        }
    }

    fn sent_sequences(effects: &[Effect]) -> Vec<u8> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Request(Apdu {
                    pdu: Pdu::ConfirmedRequest(request),
                    ..
                }) => Some(request.sequence_number),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unsegmented_request_completes() {
        let now = Instant::now();
        let mut ssm = client(TsmConfig::default(), None);

        let effects = step(&mut ssm, request(50), now);
        assert_eq!(ssm.segment_count(), 1);
        assert_eq!(ssm.state(), State::AwaitConfirmation);
        assert_eq!(ssm.deadline(), Some(now + Duration::from_millis(3000)));
        assert_eq!(effects.len(), 1);

        let effects = step(&mut ssm, reply(SimpleAck { invoke_id: 1, service_choice: 12 }), now);
        assert_eq!(ssm.state(), State::Completed);
        assert!(matches!(
            &effects[..],
            [Effect::DeliverResponse(Apdu { pdu: Pdu::SimpleAck(_), .. })]
        ));
        assert_eq!(ssm.deadline(), None);
    }

    #[test]
    fn test_segmented_request_window() {
        let now = Instant::now();
        let config = TsmConfig::default().with_segmentation(Segmentation::Both);
        let mut ssm = client(config, Some(segmenting_peer(50)));

        let effects = step(&mut ssm, request(130), now);
        assert_eq!(ssm.segment_count(), 3);
        assert_eq!(ssm.state(), State::SegmentedRequest);
        assert_eq!(sent_sequences(&effects), vec![0]);

        let effects = step(&mut ssm, reply(segment_ack(0, 2)), now);
        assert_eq!(sent_sequences(&effects), vec![1, 2]);
        assert!(ssm.sent_all_segments());
        assert_eq!(ssm.state(), State::SegmentedRequest);

        step(&mut ssm, reply(segment_ack(2, 2)), now);
        assert_eq!(ssm.state(), State::AwaitConfirmation);
    }

    #[test]
    fn test_duplicate_segment_ack_is_idempotent() {
        let now = Instant::now();
        let config = TsmConfig::default().with_segmentation(Segmentation::Both);
        let mut ssm = client(config, Some(segmenting_peer(50)));
        step(&mut ssm, request(300), now);
        assert_eq!(ssm.segment_count(), 6);

        let effects = step(&mut ssm, reply(segment_ack(0, 2)), now);
        assert_eq!(sent_sequences(&effects), vec![1, 2]);
        assert_eq!(ssm.initial_sequence_number(), 1);

        let later = now + Duration::from_millis(700);
        let effects = step(&mut ssm, reply(segment_ack(0, 2)), later);
        assert!(effects.is_empty());
        assert_eq!(ssm.initial_sequence_number(), 1);
        assert_eq!(ssm.segment_retry_count(), 0);
        assert_eq!(ssm.state(), State::SegmentedRequest);
        assert_eq!(ssm.deadline(), Some(later + Duration::from_millis(1500)));
    }

    #[test]
    fn test_segmentation_refused_without_capability() {
        let now = Instant::now();
        let mut ssm = client(TsmConfig::default(), Some(segmenting_peer(50)));

        let effects = step(&mut ssm, request(130), now);
        assert_eq!(ssm.state(), State::Aborted);
        assert_eq!(
            effects,
            vec![Effect::DeliverResponse(Apdu::new(
                peer(),
                Abort {
                    server: false,
                    invoke_id: 1,
                    reason: AbortReason::SegmentationNotSupported,
                }
            ))]
        );
    }

    #[test]
    fn test_segmentation_refused_when_peer_cannot_receive() {
        let now = Instant::now();
        let config = TsmConfig::default().with_segmentation(Segmentation::Both);
        let mut info = segmenting_peer(50);
        info.segmentation_supported = Segmentation::Transmit;
        let mut ssm = client(config, Some(info));

        step(&mut ssm, request(130), now);
        assert_eq!(ssm.state(), State::Aborted);
    }

    #[test]
    fn test_peer_max_segments_exceeded() {
        let now = Instant::now();
        let config = TsmConfig::default().with_segmentation(Segmentation::Both);
        let mut info = segmenting_peer(50);
        info.max_segments_accepted = Some(2);
        let mut ssm = client(config, Some(info));

        let effects = step(&mut ssm, request(130), now);
        assert!(matches!(
            &effects[..],
            [Effect::DeliverResponse(Apdu {
                pdu: Pdu::Abort(Abort { reason: AbortReason::ApduTooLong, .. }),
                ..
            })]
        ));
    }

    #[test]
    fn test_retry_then_no_response() {
        let now = Instant::now();
        let mut ssm = client(TsmConfig::default().with_apdu_retries(2), None);
        step(&mut ssm, request(10), now);

        for retry in 1..=2 {
            let effects = step(&mut ssm, Event::Timeout, now);
            assert_eq!(ssm.retry_count(), retry);
            assert_eq!(ssm.state(), State::AwaitConfirmation);
            assert!(matches!(
                &effects[..],
                [Effect::Request(Apdu { pdu: Pdu::ConfirmedRequest(_), .. })]
            ));
        }

        let effects = step(&mut ssm, Event::Timeout, now);
        assert_eq!(ssm.state(), State::Aborted);
        assert!(matches!(
            &effects[..],
            [Effect::DeliverResponse(Apdu {
                pdu: Pdu::Abort(Abort { reason: AbortReason::NoResponse, .. }),
                ..
            })]
        ));
    }

    #[test]
    fn test_segmented_confirmation_reassembles() {
        let now = Instant::now();
        let config = TsmConfig::default().with_segmentation(Segmentation::Both);
        let mut ssm = client(config, None);
        step(&mut ssm, request(10), now);

        let segment = |seq: u8, more: bool, data: &'static [u8]| ComplexAck {
            segmented: true,
            more_follows: more,
            invoke_id: 1,
            sequence_number: seq,
            window_size: 4,
            service_choice: 12,
            data: Bytes::from_static(data),
        };

        let effects = step(&mut ssm, reply(segment(0, true, b"abc")), now);
        assert_eq!(ssm.state(), State::SegmentedConfirmation);
        // Window is the smaller of the two proposals
        assert_eq!(ssm.actual_window_size(), 2);
        assert!(matches!(
            &effects[..],
            [Effect::Request(Apdu {
                pdu: Pdu::SegmentAck(SegmentAck { sequence_number: 0, .. }),
                ..
            })]
        ));

        // Sequence 1 is mid-window, no ack
        assert!(step(&mut ssm, reply(segment(1, true, b"def")), now).is_empty());
        let effects = step(&mut ssm, reply(segment(2, true, b"ghi")), now);
        assert_eq!(effects.len(), 1);

        let effects = step(&mut ssm, reply(segment(3, false, b"j")), now);
        assert_eq!(ssm.state(), State::Completed);
        match &effects[..] {
            [Effect::Request(_), Effect::DeliverResponse(Apdu { pdu: Pdu::ComplexAck(ack), .. })] => {
                assert!(!ack.segmented);
                assert_eq!(&ack.data[..], b"abcdefghij");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_segmented_confirmation_refused() {
        let now = Instant::now();
        let mut ssm = client(TsmConfig::default(), None);
        step(&mut ssm, request(10), now);

        let mut ack = ComplexAck::new(1, 12, vec![1, 2, 3]);
        ack.segmented = true;
        ack.more_follows = true;
        let effects = step(&mut ssm, reply(ack), now);

        assert_eq!(ssm.state(), State::Aborted);
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn test_unexpected_answer_while_segmenting() {
        let now = Instant::now();
        let config = TsmConfig::default().with_segmentation(Segmentation::Both);
        let mut ssm = client(config, Some(segmenting_peer(50)));
        step(&mut ssm, request(130), now);

        let effects = step(&mut ssm, reply(SimpleAck { invoke_id: 1, service_choice: 12 }), now);
        assert_eq!(ssm.state(), State::Aborted);
        assert!(matches!(
            &effects[..],
            [
                Effect::Request(Apdu { pdu: Pdu::Abort(Abort { reason: AbortReason::InvalidApduInThisState, .. }), .. }),
                Effect::DeliverResponse(_),
            ]
        ));
    }

    #[test]
    fn test_request_in_wrong_state() {
        let now = Instant::now();
        let mut ssm = client(TsmConfig::default(), None);
        step(&mut ssm, request(10), now);

        let mut effects = Vec::new();
        let result = ssm.handle(request(10), &mut Context::new(now, &mut effects));
        assert!(result.is_err());
    }
}
