//! Reliable event delivery on top of the unreliable datagram flow.
//!
//! A reliable payload is retained keyed by the outbound sequence that carried
//! it. When the ack tracker reports that sequence lost, the payload comes
//! back out of the channel and the caller resends it under a fresh sequence.
//! Ordering across retransmissions is not preserved; consumers must tolerate
//! reorder or carry their own ordering key.

use std::collections::HashMap;

use log::warn;

use crate::RELIABLE_MAX_RETRIES;

/// A reliable payload together with its retransmission count.
#[derive(Debug, Clone)]
pub struct ReliableEvent {
    pub payload: Vec<u8>,
    retries: u8,
}

impl ReliableEvent {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            retries: 0,
        }
    }
}

/// Sender-side state for the reliable event sublayer.
#[derive(Debug, Default)]
pub struct ReliableChannel {
    in_flight: HashMap<u16, ReliableEvent>,
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retains an event under the sequence that just carried it.
    pub fn stage(&mut self, sequence: u16, event: ReliableEvent) {
        self.in_flight.insert(sequence, event);
    }

    /// Discards events confirmed by the peer. Returns how many were settled.
    pub fn on_acked(&mut self, sequences: &[u16]) -> usize {
        let mut settled = 0;
        for sequence in sequences {
            if self.in_flight.remove(sequence).is_some() {
                settled += 1;
            }
        }
        settled
    }

    /// Pulls events whose carrier sequences were reported lost, ready to be
    /// restaged under fresh sequences. Events past the retry budget are
    /// dropped with a warning.
    pub fn take_lost(&mut self, lost: &[u16]) -> Vec<ReliableEvent> {
        let mut to_resend = Vec::new();
        for sequence in lost {
            if let Some(mut event) = self.in_flight.remove(sequence) {
                if event.retries >= RELIABLE_MAX_RETRIES {
                    warn!(
                        "dropping reliable event after {} retries ({} bytes)",
                        event.retries,
                        event.payload.len()
                    );
                    continue;
                }
                event.retries += 1;
                to_resend.push(event);
            }
        }
        to_resend
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acked_events_are_settled() {
        let mut channel = ReliableChannel::new();
        channel.stage(1, ReliableEvent::new(vec![1]));
        channel.stage(2, ReliableEvent::new(vec![2]));

        assert_eq!(channel.on_acked(&[1]), 1);
        assert_eq!(channel.in_flight(), 1);
        assert_eq!(channel.on_acked(&[1, 3]), 0);
    }

    #[test]
    fn lost_events_come_back_for_resend() {
        let mut channel = ReliableChannel::new();
        channel.stage(5, ReliableEvent::new(vec![0xAB]));

        let resend = channel.take_lost(&[5]);
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].payload, vec![0xAB]);
        assert_eq!(channel.in_flight(), 0);

        // Restage under a new sequence, as the sender loop does.
        channel.stage(9, resend.into_iter().next().unwrap());
        assert_eq!(channel.in_flight(), 1);
    }

    #[test]
    fn retry_budget_is_enforced() {
        let mut channel = ReliableChannel::new();
        let mut event = ReliableEvent::new(vec![1, 2, 3]);

        for attempt in 0..RELIABLE_MAX_RETRIES {
            channel.stage(attempt as u16 + 1, event);
            let mut resend = channel.take_lost(&[attempt as u16 + 1]);
            assert_eq!(resend.len(), 1, "attempt {}", attempt);
            event = resend.pop().unwrap();
        }

        // The budget is spent; the next loss drops the event.
        channel.stage(100, event);
        assert!(channel.take_lost(&[100]).is_empty());
        assert_eq!(channel.in_flight(), 0);
    }
}
