//! Async driver for the gossip engine: the once-a-second tick loop, the
//! shadow-round wait, message delivery and orderly shutdown. The engine
//! itself stays synchronous and deterministic; this module is the only
//! place wall clocks and tasks live.

use crate::endpoint::EndpointId;
use crate::gossip::engine::{Gossiper, ShadowPoll, ShadowRoundError};
use crate::gossip::messages::GossipMessage;
use crate::gossip::state::EndpointState;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Hands outbound gossip frames to the messaging layer.
pub trait GossipTransport: Send + Sync {
    fn send(&self, to: &EndpointId, message: GossipMessage);
}

pub fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The generation a freshly started node announces.
pub fn generation_from_wall_clock() -> i32 {
    (wall_millis() / 1000) as i32
}

pub struct GossipService {
    gossiper: Arc<Mutex<Gossiper>>,
    transport: Arc<dyn GossipTransport>,
}

impl GossipService {
    pub fn new(gossiper: Arc<Mutex<Gossiper>>, transport: Arc<dyn GossipTransport>) -> Self {
        Self { gossiper, transport }
    }

    pub fn gossiper(&self) -> Arc<Mutex<Gossiper>> {
        Arc::clone(&self.gossiper)
    }

    /// Spawns the tick loop. One round per configured interval until the
    /// returned handle is aborted.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let gossiper = Arc::clone(&self.gossiper);
        let transport = Arc::clone(&self.transport);
        let tick_interval = gossiper.lock().config().interval;
        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            loop {
                ticker.tick().await;
                let outbound = gossiper.lock().tick(Instant::now(), wall_millis());
                for (to, message) in outbound {
                    transport.send(&to, message);
                }
            }
        })
    }

    /// Feeds one inbound message through the engine and sends the replies.
    /// Protocol violations drop the message and leave the peer to the
    /// failure detector.
    pub fn deliver(&self, from: &EndpointId, message: GossipMessage) {
        let replies = {
            let mut gossiper = self.gossiper.lock();
            match gossiper.handle_message(from, message, Instant::now(), wall_millis()) {
                Ok(replies) => replies,
                Err(err) => {
                    warn!("dropping gossip message from {from}: {err}");
                    return;
                }
            }
        };
        for (to, reply) in replies {
            self.transport.send(&to, reply);
        }
    }

    /// Runs the pre-join shadow round to completion: send the empty SYNs,
    /// poll once per interval, resending as directed, until the engine
    /// reports the collected state or gives up.
    pub async fn run_shadow_round(
        &self,
        extra_peers: Vec<EndpointId>,
    ) -> Result<Vec<(EndpointId, EndpointState)>, ShadowRoundError> {
        let poll_interval = {
            let mut gossiper = self.gossiper.lock();
            let outbound = gossiper.start_shadow_round(extra_peers, Instant::now());
            for (to, message) in outbound {
                self.transport.send(&to, message);
            }
            gossiper.config().interval
        };

        loop {
            tokio::time::sleep(poll_interval).await;
            let poll = self.gossiper.lock().poll_shadow_round(Instant::now())?;
            match poll {
                ShadowPoll::Complete(states) => {
                    debug!("shadow round finished with {} endpoint states", states.len());
                    return Ok(states);
                }
                ShadowPoll::Resend(outbound) => {
                    for (to, message) in outbound {
                        self.transport.send(&to, message);
                    }
                }
                ShadowPoll::Waiting => {}
            }
        }
    }

    /// Announces shutdown, waits out the configured grace so the one-way
    /// messages drain, then silences the ticker.
    pub async fn shutdown(&self, ticker: JoinHandle<()>) {
        let (outbound, grace) = {
            let mut gossiper = self.gossiper.lock();
            let grace = gossiper.config().shutdown_grace;
            (gossiper.announce_shutdown(Instant::now()), grace)
        };
        for (to, message) in outbound {
            self.transport.send(&to, message);
        }
        tokio::time::sleep(grace).await;
        ticker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use crate::gossip::detector::DetectorConfig;
    use crate::gossip::engine::NoMembers;
    use crate::gossip::messages::{GossipDigestSyn, GossipMessage};
    use crate::ring::token::Murmur3Partitioner;
    use std::time::Duration;
    use uuid::Uuid;

    fn ep(n: u8) -> EndpointId {
        EndpointId::from_broadcast(
            format!("10.0.0.{n}:7000").parse().unwrap(),
            Some(Uuid::from_u128(n as u128)),
        )
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(EndpointId, GossipMessage)>>,
    }

    impl GossipTransport for RecordingTransport {
        fn send(&self, to: &EndpointId, message: GossipMessage) {
            self.sent.lock().push((to.clone(), message));
        }
    }

    fn service(seeds: Vec<EndpointId>) -> (GossipService, Arc<RecordingTransport>) {
        let mut config = GossipConfig::new("runtime-test", seeds);
        config.interval = Duration::from_millis(10);
        config.ring_delay = Duration::from_millis(40);
        config.shutdown_grace = Duration::from_millis(10);
        let gossiper = Gossiper::new(
            config,
            ep(1),
            DetectorConfig::default(),
            Arc::new(NoMembers),
            Arc::new(Murmur3Partitioner),
            5,
            Instant::now(),
        );
        let transport = Arc::new(RecordingTransport::default());
        (
            GossipService::new(
                Arc::new(Mutex::new(gossiper)),
                Arc::clone(&transport) as Arc<dyn GossipTransport>,
            ),
            transport,
        )
    }

    #[tokio::test]
    async fn ticker_sends_syns_to_the_seed() {
        let (service, transport) = service(vec![ep(2)]);
        service
            .gossiper()
            .lock()
            .start(generation_from_wall_clock(), Vec::new(), Instant::now());
        let ticker = service.spawn_ticker();
        tokio::time::sleep(Duration::from_millis(60)).await;
        ticker.abort();
        let sent = transport.sent.lock();
        assert!(sent
            .iter()
            .any(|(to, message)| *to == ep(2) && matches!(message, GossipMessage::Syn(_))));
    }

    #[tokio::test]
    async fn delivered_syn_produces_an_ack() {
        let (service, transport) = service(vec![ep(2)]);
        service
            .gossiper()
            .lock()
            .start(generation_from_wall_clock(), Vec::new(), Instant::now());
        service.deliver(
            &ep(2),
            GossipMessage::Syn(GossipDigestSyn {
                cluster_name: "runtime-test".into(),
                partitioner_name: "Murmur3Partitioner".into(),
                digests: Vec::new(),
            }),
        );
        let sent = transport.sent.lock();
        assert!(matches!(sent[0].1, GossipMessage::Ack(_)));
    }

    #[tokio::test]
    async fn shadow_round_without_seed_reply_fails() {
        let (service, _transport) = service(vec![ep(2)]);
        let result = service.run_shadow_round(Vec::new()).await;
        assert!(matches!(result, Err(ShadowRoundError::NoSeedResponse(_))));
    }

    #[tokio::test]
    async fn shutdown_announces_and_stops_the_ticker() {
        let (service, transport) = service(vec![ep(2)]);
        service
            .gossiper()
            .lock()
            .start(generation_from_wall_clock(), Vec::new(), Instant::now());
        let ticker = service.spawn_ticker();
        service.shutdown(ticker).await;
        assert!(!service.gossiper().lock().is_enabled());
        // Peers are only notified when live; with none, silence is fine.
        let _ = transport.sent.lock().len();
    }
}
