//! Server role: a confirmed request received from a peer.
//!
//! ```text
//! IDLE --request--> AWAIT_RESPONSE --answer--> COMPLETED
//!   |                  ^      |
//!   |   last segment   |      +--segmented ComplexAck--> SEGMENTED_RESPONSE --final SegAck--> COMPLETED
//!   +--> SEGMENTED_REQUEST
//! ```

use log::debug;

use super::segmentation::{Acknowledged, Reassembly};
use super::{Context, Effect, Event, Ssm, State, MAX_SEGMENTS};
use crate::apdu::{AbortReason, ComplexAck, ConfirmedRequest, Pdu};
use crate::error::Result;

impl Ssm {
    pub(super) fn server_event(&mut self, event: Event, cx: &mut Context<'_>) -> Result<()> {
        match event {
            Event::Indication(apdu) => match self.state {
                State::Idle => self.server_idle(apdu.pdu, cx),
                State::SegmentedRequest => self.receive_request_segment(apdu.pdu, cx),
                State::AwaitResponse => self.await_response(apdu.pdu, cx),
                State::SegmentedResponse => self.segmented_response(apdu.pdu, cx),
                _ => Err(self.invalid(&apdu.pdu)),
            },
            Event::Confirmation(apdu) => self.application_answer(apdu.pdu, cx),
            Event::Timeout => self.server_timeout(cx),
        }
    }

    fn server_idle(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        let request = match pdu {
            Pdu::ConfirmedRequest(request) => request,
            other => return Err(self.invalid(&other)),
        };
        self.learn_from_request(&request, cx);

        if !request.segmented {
            self.set_state(State::AwaitResponse, Some(self.config.application_timeout()), cx.now)?;
            self.to_application(request, cx);
            return Ok(());
        }

        if !self.config.segmentation_supported.can_receive() {
            return self.abort_to(AbortReason::SegmentationNotSupported, true, false, cx);
        }
        if request.sequence_number != 0 {
            return self.abort_to(AbortReason::InvalidApduInThisState, true, false, cx);
        }

        let window_size = request.window_size;
        let more_follows = request.more_follows;
        self.begin_receive(Pdu::ConfirmedRequest(request), window_size)?;
        self.send_segment_ack(false, 0, cx);

        if more_follows {
            self.set_state(State::SegmentedRequest, Some(self.config.segment_timeout), cx.now)
        } else {
            self.deliver_request(cx)
        }
    }

    /// Record what the client declared about itself.
    fn learn_from_request(&mut self, request: &ConfirmedRequest, cx: &mut Context<'_>) {
        self.segmented_response_accepted = request.segmented_response_accepted;
        self.peer_max_segments = request.max_segments_accepted;

        let declared = usize::from(request.max_apdu_length_accepted);
        self.peer_max_apdu_length = Some(match &self.device_info {
            Some(info) => declared.min(info.max_apdu_length_accepted),
            None => declared,
        });

        if !request.segmented_response_accepted {
            return;
        }
        if let Some(info) = self.device_info.as_mut() {
            if !info.segmentation_supported.can_receive() {
                info.segmentation_supported = info.segmentation_supported.with_receive();
                debug!(
                    "Device {} accepts segmented responses, now {:?}",
                    info.address, info.segmentation_supported
                );
                cx.effects.push(Effect::UpdateDeviceInfo(info.clone()));
            }
        }
    }

    /// Hand the complete request to the application and wait for its answer.
    fn deliver_request(&mut self, cx: &mut Context<'_>) -> Result<()> {
        self.set_state(State::AwaitResponse, Some(self.config.application_timeout()), cx.now)?;
        let request = self.reassembled()?;
        self.to_application(request, cx);
        Ok(())
    }

    fn receive_request_segment(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        match pdu {
            Pdu::Abort(_) => self.set_state(State::Aborted, None, cx.now),
            Pdu::ConfirmedRequest(request) if request.segmented => {
                match self.segment_received(
                    request.sequence_number,
                    request.more_follows,
                    &request.data,
                    cx,
                )? {
                    Reassembly::Complete => self.deliver_request(cx),
                    Reassembly::Overflow => {
                        self.abort_to(AbortReason::BufferOverflow, true, false, cx)
                    }
                    Reassembly::InProgress | Reassembly::OutOfOrder => Ok(()),
                }
            }
            _ => self.abort_to(AbortReason::InvalidApduInThisState, true, false, cx),
        }
    }

    fn await_response(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        match pdu {
            Pdu::ConfirmedRequest(_) => {
                debug!(
                    "Transaction {} with {}: duplicate request while in progress",
                    self.invoke_id, self.peer
                );
                Ok(())
            }
            Pdu::Abort(abort) => {
                self.set_state(State::Aborted, None, cx.now)?;
                self.to_application(abort, cx);
                Ok(())
            }
            Pdu::SegmentAck(_) => self.abort_to(AbortReason::InvalidApduInThisState, true, true, cx),
            other => Err(self.invalid(&other)),
        }
    }

    fn segmented_response(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        match pdu {
            Pdu::SegmentAck(ack) => {
                if self.segment_acknowledged(&ack, cx)? == Acknowledged::Final {
                    self.set_state(State::Completed, None, cx.now)?;
                }
                Ok(())
            }
            Pdu::Abort(abort) => {
                self.set_state(State::Aborted, None, cx.now)?;
                self.to_application(abort, cx);
                Ok(())
            }
            Pdu::ConfirmedRequest(_) => Ok(()),
            other => Err(self.invalid(&other)),
        }
    }

    /// The application answers the request.
    fn application_answer(&mut self, pdu: Pdu, cx: &mut Context<'_>) -> Result<()> {
        if self.state != State::AwaitResponse {
            return Err(self.invalid(&pdu));
        }
        match pdu {
            Pdu::Abort(mut abort) => {
                abort.server = true;
                self.set_state(State::Aborted, None, cx.now)?;
                self.to_network(abort, cx);
                Ok(())
            }
            Pdu::SimpleAck(_) | Pdu::Error(_) | Pdu::Reject(_) => {
                self.set_state(State::Completed, None, cx.now)?;
                self.to_network(pdu, cx);
                Ok(())
            }
            Pdu::ComplexAck(ack) => self.send_response(ack, cx),
            other => Err(self.invalid(&other)),
        }
    }

    fn send_response(&mut self, ack: ComplexAck, cx: &mut Context<'_>) -> Result<()> {
        self.set_segmentation_context(Pdu::ComplexAck(ack))?;

        // The local max APDU length also caps what this device sends
        let mut max_length = self.config.max_apdu_length_accepted;
        if let Some(peer_max) = self.peer_max_apdu_length {
            max_length = max_length.min(peer_max);
        }
        if let Some(npdu) = self.device_info.as_ref().and_then(|info| info.max_npdu_length) {
            max_length = max_length.min(npdu);
        }
        self.compute_segmentation(max_length)?;

        if self.segment_count > 1 {
            if let Some(reason) = self.response_segmentation_refused() {
                return self.abort_to(reason, true, true, cx);
            }
        }

        self.begin_transmit();
        if self.segment_count == 1 {
            self.set_state(State::Completed, None, cx.now)?;
        } else {
            self.set_state(State::SegmentedResponse, Some(self.config.segment_timeout), cx.now)?;
        }

        let segment = self.get_segment(0)?;
        self.to_network(segment, cx);
        Ok(())
    }

    fn response_segmentation_refused(&self) -> Option<AbortReason> {
        if !self.config.segmentation_supported.can_transmit() || !self.segmented_response_accepted {
            return Some(AbortReason::SegmentationNotSupported);
        }
        if self.segment_count > MAX_SEGMENTS {
            return Some(AbortReason::ApduTooLong);
        }
        match self.peer_max_segments {
            Some(max) if self.segment_count > usize::from(max) => Some(AbortReason::ApduTooLong),
            _ => None,
        }
    }

    fn server_timeout(&mut self, cx: &mut Context<'_>) -> Result<()> {
        match self.state {
            State::SegmentedRequest => self.abort_to(AbortReason::NoResponse, true, false, cx),
            State::AwaitResponse => self.abort_to(AbortReason::ServerTimeout, true, true, cx),
            State::SegmentedResponse => {
                if !self.resend_window(cx)? {
                    self.abort_to(AbortReason::NoResponse, true, true, cx)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
