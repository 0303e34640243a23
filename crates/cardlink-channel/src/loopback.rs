use std::collections::VecDeque;

use cardlink_core::{ApduCommand, ApduResponse, TransportError};

use crate::contract::CardChannel;

/// In-memory channel for consumers' tests: replays canned responses and
/// records every command it was asked to send.
#[derive(Debug, Default)]
pub struct LoopbackChannel {
    responses: VecDeque<ApduResponse>,
    sent: Vec<ApduCommand>,
    closed: bool,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the response returned by the next `send`.
    pub fn enqueue_response(&mut self, response: ApduResponse) {
        self.responses.push_back(response);
    }

    /// Drains and returns all commands sent so far.
    pub fn take_sent(&mut self) -> Vec<ApduCommand> {
        std::mem::take(&mut self.sent)
    }
}

impl CardChannel for LoopbackChannel {
    fn send(&mut self, command: &ApduCommand) -> Result<ApduResponse, TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        self.sent.push(command.clone());
        self.responses
            .pop_front()
            .ok_or(TransportError::ReadTimeout(0))
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn pairing_key_iterations(&self) -> u32 {
        1
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_replays_responses_in_order() {
        let mut channel = LoopbackChannel::new();
        channel.enqueue_response(ApduResponse::from_raw(&[0x01, 0x90, 0x00]).unwrap());
        channel.enqueue_response(ApduResponse::from_raw(&[0x6a, 0x82]).unwrap());

        let cmd = ApduCommand::new(0x00, 0xa4, 0x04, 0x00, Vec::new());
        assert!(channel.send(&cmd).unwrap().is_ok());
        assert_eq!(channel.send(&cmd).unwrap().sw(), 0x6a82);
        assert_eq!(channel.take_sent().len(), 2);
    }

    #[test]
    fn loopback_close_is_idempotent_and_disconnects() {
        let mut channel = LoopbackChannel::new();
        assert!(channel.is_connected());
        channel.close();
        channel.close();
        assert!(!channel.is_connected());

        let cmd = ApduCommand::new(0x00, 0x00, 0x00, 0x00, Vec::new());
        assert!(matches!(
            channel.send(&cmd),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn loopback_without_scripted_response_times_out() {
        let mut channel = LoopbackChannel::new();
        let cmd = ApduCommand::new(0x00, 0x00, 0x00, 0x00, Vec::new());
        assert!(matches!(
            channel.send(&cmd),
            Err(TransportError::ReadTimeout(_))
        ));
    }
}
