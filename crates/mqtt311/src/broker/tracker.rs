//! Per-connection QoS 1/2 in-flight state.
//!
//! Two directions, each a map from packet id to the exchange phase,
//! backed by a bounded token pool: publish tokens admit inbound
//! QoS 1/2 publishes, inflight tokens gate outbound QoS > 0 sends.
//! A token that cannot be acquired within the configured timeout is
//! fatal to the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use mqtt311_protocol::{MqttError, Result};

use crate::broker::backend::Ack;

/// Inbound exchange phase (client to broker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundPhase {
    /// QoS 2 publish stored, PUBREC sent, waiting for PUBREL.
    AwaitingPubRel,
}

/// Outbound exchange phase (broker to client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPhase {
    /// QoS 1 publish sent, waiting for PUBACK.
    AwaitingPubAck,
    /// QoS 2 publish sent, waiting for PUBREC.
    AwaitingPubRec,
    /// PUBREL sent, waiting for PUBCOMP.
    AwaitingPubComp,
}

struct InboundFlow {
    phase: InboundPhase,
    _permit: OwnedSemaphorePermit,
}

struct OutboundFlow {
    phase: OutboundPhase,
    ack: Option<Ack>,
    // Absent for redeliveries admitted past a drained pool.
    _permit: Option<OwnedSemaphorePermit>,
}

/// In-flight state machine for one connection.
pub struct Tracker {
    publish_tokens: Arc<Semaphore>,
    inflight_tokens: Arc<Semaphore>,
    token_timeout: Duration,
    inbound: HashMap<u16, InboundFlow>,
    outbound: HashMap<u16, OutboundFlow>,
}

impl Tracker {
    #[must_use]
    pub fn new(parallel_publishes: usize, inflight_messages: usize, token_timeout: Duration) -> Self {
        Self {
            publish_tokens: Arc::new(Semaphore::new(parallel_publishes.max(1))),
            inflight_tokens: Arc::new(Semaphore::new(inflight_messages.max(1))),
            token_timeout,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    /// Admits one inbound QoS 1/2 publish.
    pub async fn acquire_publish_token(&self) -> Result<OwnedSemaphorePermit> {
        Self::acquire(&self.publish_tokens, self.token_timeout).await
    }

    /// Reserves one slot in the outbound inflight window.
    pub async fn acquire_inflight_token(&self) -> Result<OwnedSemaphorePermit> {
        Self::acquire(&self.inflight_tokens, self.token_timeout).await
    }

    /// Non-blocking inflight reservation, used when resending stored
    /// packets on session resume: redelivery must not fail on a
    /// window smaller than the stored backlog.
    #[must_use]
    pub fn try_acquire_inflight_token(&self) -> Option<OwnedSemaphorePermit> {
        self.inflight_tokens.clone().try_acquire_owned().ok()
    }

    async fn acquire(pool: &Arc<Semaphore>, wait: Duration) -> Result<OwnedSemaphorePermit> {
        match timeout(wait, pool.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(MqttError::Closing),
            Err(_) => Err(MqttError::TokenTimeout),
        }
    }

    /// Records an inbound QoS 2 publish awaiting its PUBREL.
    pub fn begin_inbound(&mut self, id: u16, permit: OwnedSemaphorePermit) {
        self.inbound.insert(
            id,
            InboundFlow {
                phase: InboundPhase::AwaitingPubRel,
                _permit: permit,
            },
        );
    }

    #[must_use]
    pub fn has_inbound(&self, id: u16) -> bool {
        self.inbound.contains_key(&id)
    }

    /// Completes an inbound QoS 2 exchange, releasing its token.
    /// Returns whether the id was known.
    pub fn complete_inbound(&mut self, id: u16) -> bool {
        self.inbound.remove(&id).is_some()
    }

    /// Records an outbound QoS 1/2 send.
    pub fn begin_outbound(
        &mut self,
        id: u16,
        phase: OutboundPhase,
        permit: Option<OwnedSemaphorePermit>,
        ack: Option<Ack>,
    ) {
        self.outbound.insert(
            id,
            OutboundFlow {
                phase,
                ack,
                _permit: permit,
            },
        );
    }

    /// Handles a PUBACK: the id must be a QoS 1 send awaiting it.
    pub fn on_puback(&mut self, id: u16) -> Result<Option<Ack>> {
        match self.outbound.get(&id) {
            Some(flow) if flow.phase == OutboundPhase::AwaitingPubAck => {
                Ok(self.outbound.remove(&id).and_then(|flow| flow.ack))
            }
            Some(_) => Err(MqttError::ProtocolViolation(format!(
                "unexpected PUBACK for QoS 2 exchange {id}"
            ))),
            None => Err(MqttError::ProtocolViolation(format!(
                "PUBACK for unknown packet id {id}"
            ))),
        }
    }

    /// Handles a PUBREC: moves the exchange to awaiting PUBCOMP.
    pub fn on_pubrec(&mut self, id: u16) -> Result<()> {
        match self.outbound.get_mut(&id) {
            Some(flow) if flow.phase == OutboundPhase::AwaitingPubRec => {
                flow.phase = OutboundPhase::AwaitingPubComp;
                Ok(())
            }
            Some(_) => Err(MqttError::ProtocolViolation(format!(
                "unexpected PUBREC for packet id {id}"
            ))),
            None => Err(MqttError::ProtocolViolation(format!(
                "PUBREC for unknown packet id {id}"
            ))),
        }
    }

    /// Handles a PUBCOMP: the id must be awaiting it.
    pub fn on_pubcomp(&mut self, id: u16) -> Result<Option<Ack>> {
        match self.outbound.get(&id) {
            Some(flow) if flow.phase == OutboundPhase::AwaitingPubComp => {
                Ok(self.outbound.remove(&id).and_then(|flow| flow.ack))
            }
            Some(_) => Err(MqttError::ProtocolViolation(format!(
                "unexpected PUBCOMP for packet id {id}"
            ))),
            None => Err(MqttError::ProtocolViolation(format!(
                "PUBCOMP for unknown packet id {id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Tracker {
        Tracker::new(1, 1, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_publish_token_exhaustion_times_out() {
        let mut tracker = tracker();
        let permit = tracker.acquire_publish_token().await.unwrap();
        tracker.begin_inbound(1, permit);

        let err = tracker.acquire_publish_token().await.unwrap_err();
        assert!(matches!(err, MqttError::TokenTimeout));

        // Completing the exchange frees the token.
        assert!(tracker.complete_inbound(1));
        assert!(tracker.acquire_publish_token().await.is_ok());
    }

    #[tokio::test]
    async fn test_outbound_qos1_flow() {
        let mut tracker = tracker();
        let permit = tracker.acquire_inflight_token().await.unwrap();
        tracker.begin_outbound(5, OutboundPhase::AwaitingPubAck, Some(permit), None);

        // PUBREC/PUBCOMP are wrong for a QoS 1 exchange.
        assert!(tracker.on_pubrec(5).is_err());
        assert!(tracker.on_pubcomp(5).is_err());

        assert!(tracker.on_puback(5).unwrap().is_none());
        assert!(tracker.acquire_inflight_token().await.is_ok());
    }

    #[tokio::test]
    async fn test_outbound_qos2_flow() {
        let mut tracker = tracker();
        let permit = tracker.acquire_inflight_token().await.unwrap();

        let acked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = acked.clone();
        tracker.begin_outbound(
            9,
            OutboundPhase::AwaitingPubRec,
            Some(permit),
            Some(Box::new(move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })),
        );

        assert!(tracker.on_puback(9).is_err());
        tracker.on_pubrec(9).unwrap();
        assert!(tracker.on_pubrec(9).is_err());

        let ack = tracker.on_pubcomp(9).unwrap().unwrap();
        ack();
        assert!(acked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_fatal() {
        let mut tracker = tracker();
        assert!(tracker.on_puback(1).is_err());
        assert!(tracker.on_pubrec(2).is_err());
        assert!(tracker.on_pubcomp(3).is_err());
    }
}
