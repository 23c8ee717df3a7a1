//! Per-connection protocol engine.
//!
//! One task owns one framed byte stream and one session, moving
//! through `Connecting -> Connected -> (Clean | Disconnecting) ->
//! Closed`. Inside the connected state the reader, the dequeuer and
//! the keep-alive deadline run cooperatively in one select loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mqtt311_protocol::packet::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PubAckPacket, PubCompPacket,
    PubRecPacket, PubRelPacket, PublishPacket, SubAckPacket, SubscribePacket, SubscribeReturnCode,
    UnsubAckPacket, UnsubscribePacket,
};
use mqtt311_protocol::{valid_topic_filter, Message, MqttError, QoS, Result};

use crate::broker::backend::{next_connection_id, Ack, Backend, ConnectionId, SessionHandle};
use crate::broker::config::BrokerConfig;
use crate::broker::session::Direction;
use crate::broker::tracker::{OutboundPhase, Tracker};
use crate::broker::transport::{read_packet, write_packet};

enum Flow {
    Continue,
    /// DISCONNECT received: leave without publishing the will.
    Clean,
}

/// The engine for one client connection.
pub struct ClientHandler<S> {
    stream: S,
    connection_id: ConnectionId,
    config: Arc<BrokerConfig>,
    backend: Arc<dyn Backend>,
    close_token: CancellationToken,
    tracker: Tracker,
    read_buf: BytesMut,
    write_buf: BytesMut,
    client_id: String,
    session: Option<Arc<SessionHandle>>,
}

impl<S> ClientHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        config: Arc<BrokerConfig>,
        backend: Arc<dyn Backend>,
        close_token: CancellationToken,
    ) -> Self {
        let tracker = Tracker::new(
            config.client_parallel_publishes,
            config.client_inflight_messages,
            config.client_token_timeout,
        );
        Self {
            stream,
            connection_id: next_connection_id(),
            config,
            backend,
            close_token,
            tracker,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            client_id: String::new(),
            session: None,
        }
    }

    /// Runs the connection to completion.
    ///
    /// # Errors
    /// Returns the error that ended the connection; orderly ends
    /// (DISCONNECT, peer close, takeover) are not errors to the
    /// caller's accept loop but are reported for logging.
    pub async fn run(mut self) -> Result<()> {
        let connect = match self.wait_for_connect().await {
            Ok(Some(connect)) => connect,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        };

        self.client_id = connect.client_id.clone();
        let (session, resumed) = match self.establish(&connect).await {
            Ok(Some(setup)) => setup,
            Ok(None) => return Ok(()),
            Err(err) => {
                // The session may already be owned; release it so the
                // client id is not wedged until a takeover.
                if let Some(session) = self.session.clone() {
                    let _ = self
                        .backend
                        .terminate(self.connection_id, &self.client_id, &session)
                        .await;
                }
                return Err(err);
            }
        };

        info!(
            client_id = %self.client_id,
            clean = connect.clean_session,
            resumed,
            "client connected"
        );

        let keep_alive = self
            .config
            .effective_keep_alive(Duration::from_secs(u64::from(connect.keep_alive)));

        let result = self.connected(&session, keep_alive).await;

        // Any abrupt end publishes the will; a DISCONNECT already
        // cleared it.
        if result.is_err() {
            self.publish_will(&session).await;
        }

        if let Err(err) = self
            .backend
            .terminate(self.connection_id, &self.client_id, &session)
            .await
        {
            warn!(client_id = %self.client_id, error = %err, "terminate failed");
        }

        match result {
            Ok(()) => {
                info!(client_id = %self.client_id, "client disconnected");
                Ok(())
            }
            Err(err) if err.is_normal_disconnect() => {
                debug!(client_id = %self.client_id, reason = %err, "connection ended");
                Ok(())
            }
            Err(err) => {
                warn!(client_id = %self.client_id, error = %err, "connection failed");
                Err(err)
            }
        }
    }

    /// Connecting state: the first packet must be CONNECT within the
    /// connect timeout; anything else ends the connection silently.
    async fn wait_for_connect(&mut self) -> Result<Option<ConnectPacket>> {
        let first = timeout(
            self.config.connect_timeout,
            read_packet(&mut self.stream, &mut self.read_buf),
        )
        .await;

        match first {
            Ok(Ok(Packet::Connect(connect))) => Ok(Some(*connect)),
            Ok(Ok(packet)) => {
                debug!(kind = ?packet.packet_type(), "first packet was not CONNECT");
                Ok(None)
            }
            Ok(Err(MqttError::UnsupportedProtocolVersion)) => {
                self.send_connack(ConnectReturnCode::UnacceptableProtocolVersion)
                    .await?;
                Ok(None)
            }
            Ok(Err(err)) if err.is_normal_disconnect() => Ok(None),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                debug!("no CONNECT within timeout");
                Err(MqttError::ConnectTimeout)
            }
        }
    }

    /// Authenticates, sets up the session, replies CONNACK, resends
    /// stored inflight packets and primes retained delivery.
    async fn establish(
        &mut self,
        connect: &ConnectPacket,
    ) -> Result<Option<(Arc<SessionHandle>, bool)>> {
        if connect.client_id.is_empty() && !connect.clean_session {
            self.send_connack(ConnectReturnCode::IdentifierRejected)
                .await?;
            return Ok(None);
        }

        let authenticated = match self
            .backend
            .authenticate(connect.username.as_deref(), connect.password.as_deref())
            .await
        {
            Ok(ok) => ok,
            Err(err) => {
                debug!(error = %err, "authentication unavailable");
                self.send_connack(ConnectReturnCode::ServerUnavailable)
                    .await?;
                return Ok(None);
            }
        };
        if !authenticated {
            self.send_connack(ConnectReturnCode::NotAuthorized).await?;
            return Ok(None);
        }

        let setup = match self
            .backend
            .setup(self.connection_id, &connect.client_id, connect.clean_session)
            .await
        {
            Ok(setup) => setup,
            Err(err) => {
                // A takeover that timed out fails this CONNACK path;
                // the stuck victim is reaped lazily.
                warn!(client_id = %connect.client_id, error = %err, "setup failed");
                self.send_connack(ConnectReturnCode::ServerUnavailable)
                    .await?;
                return Ok(None);
            }
        };
        let session = setup.session;
        let resumed = setup.resumed;
        self.session = Some(session.clone());

        let session_present = resumed && !connect.clean_session;
        self.write(&Packet::ConnAck(ConnAckPacket::new(
            ConnectReturnCode::Accepted,
            session_present,
        )))
        .await?;

        if let Some(will) = connect.will.clone() {
            session.store().save_will(will)?;
        }

        self.resend_stored(&session).await?;
        self.backend.restored(&session).await?;

        for subscription in session.store().all_subscriptions()? {
            self.backend
                .queue_retained(&session, &subscription.topic)
                .await?;
        }

        Ok(Some((session, resumed)))
    }

    /// Re-sends stored outgoing packets in id order: publishes with
    /// `DUP=1`, release markers as PUBREL.
    async fn resend_stored(&mut self, session: &Arc<SessionHandle>) -> Result<()> {
        for stored in session.store().all_packets(Direction::Outgoing)? {
            match stored {
                Packet::Publish(publish) => {
                    let Some(id) = publish.packet_id else { continue };
                    let permit = self.tracker.try_acquire_inflight_token();
                    let phase = match publish.message.qos {
                        QoS::AtLeastOnce => OutboundPhase::AwaitingPubAck,
                        _ => OutboundPhase::AwaitingPubRec,
                    };
                    self.tracker.begin_outbound(id, phase, permit, None);
                    self.write(&Packet::Publish(publish.with_dup(true))).await?;
                }
                Packet::PubRel(pubrel) => {
                    let permit = self.tracker.try_acquire_inflight_token();
                    self.tracker.begin_outbound(
                        pubrel.packet_id,
                        OutboundPhase::AwaitingPubComp,
                        permit,
                        None,
                    );
                    self.write(&Packet::PubRel(pubrel)).await?;
                }
                other => {
                    debug!(kind = ?other.packet_type(), "ignoring stored packet");
                }
            }
        }
        Ok(())
    }

    /// Connected state: reader, dequeuer and keep-alive deadline.
    async fn connected(
        &mut self,
        session: &Arc<SessionHandle>,
        keep_alive: Duration,
    ) -> Result<()> {
        let kill = session.kill_token();
        let close = self.close_token.clone();
        let session = session.clone();

        // Read deadline at 1.5x the (possibly capped) keep-alive.
        let deadline = keep_alive * 3 / 2;
        let mut ticker = tokio::time::interval(if keep_alive.is_zero() {
            Duration::from_secs(60)
        } else {
            keep_alive
        });
        ticker.reset();
        let mut last_packet = tokio::time::Instant::now();

        loop {
            tokio::select! {
                read = read_packet(&mut self.stream, &mut self.read_buf) => {
                    last_packet = tokio::time::Instant::now();
                    match self.handle_packet(&session, read?).await? {
                        Flow::Continue => {}
                        Flow::Clean => return Ok(()),
                    }
                }

                dequeued = self.backend.dequeue(&session, &close) => {
                    match dequeued? {
                        Some((message, ack)) => {
                            self.send_message(&session, message, ack).await?;
                        }
                        // Engine close: abrupt shutdown.
                        None => return Err(MqttError::Closing),
                    }
                }

                () = kill.cancelled() => return Err(MqttError::Killed),

                _ = ticker.tick(), if !keep_alive.is_zero() => {
                    if last_packet.elapsed() > deadline {
                        return Err(MqttError::KeepAliveTimeout);
                    }
                }
            }
        }
    }

    /// Dispatch table for the connected state.
    async fn handle_packet(&mut self, session: &Arc<SessionHandle>, packet: Packet) -> Result<Flow> {
        match packet {
            Packet::Connect(_) => Err(MqttError::ProtocolViolation(
                "duplicate CONNECT".to_string(),
            )),
            Packet::Publish(publish) => {
                self.handle_publish(session, publish).await?;
                Ok(Flow::Continue)
            }
            Packet::PubAck(PubAckPacket { packet_id }) => {
                let ack = self.tracker.on_puback(packet_id)?;
                session.store().delete_packet(Direction::Outgoing, packet_id)?;
                if let Some(ack) = ack {
                    ack();
                }
                Ok(Flow::Continue)
            }
            Packet::PubRec(PubRecPacket { packet_id }) => {
                self.tracker.on_pubrec(packet_id)?;
                session.store().save_packet(
                    Direction::Outgoing,
                    packet_id,
                    Packet::PubRel(PubRelPacket::new(packet_id)),
                )?;
                self.write(&Packet::PubRel(PubRelPacket::new(packet_id)))
                    .await?;
                Ok(Flow::Continue)
            }
            Packet::PubRel(PubRelPacket { packet_id }) => {
                self.handle_pubrel(session, packet_id).await?;
                Ok(Flow::Continue)
            }
            Packet::PubComp(PubCompPacket { packet_id }) => {
                let ack = self.tracker.on_pubcomp(packet_id)?;
                session.store().delete_packet(Direction::Outgoing, packet_id)?;
                if let Some(ack) = ack {
                    ack();
                }
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(session, subscribe).await?;
                Ok(Flow::Continue)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(session, unsubscribe).await?;
                Ok(Flow::Continue)
            }
            Packet::PingReq => {
                self.write(&Packet::PingResp).await?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => {
                session.store().clear_will()?;
                Ok(Flow::Clean)
            }
            other => Err(MqttError::ProtocolViolation(format!(
                "unexpected {:?} from client",
                other.packet_type()
            ))),
        }
    }

    async fn handle_publish(
        &mut self,
        session: &Arc<SessionHandle>,
        publish: PublishPacket,
    ) -> Result<()> {
        if publish.message.retain {
            if publish.message.payload.is_empty() {
                self.backend.clear_retained(&publish.message.topic).await?;
            } else {
                self.backend.store_retained(publish.message.clone()).await?;
            }
        }

        match publish.message.qos {
            QoS::AtMostOnce => {
                self.backend
                    .publish(self.connection_id, routed(&publish.message))
                    .await
            }
            QoS::AtLeastOnce => {
                let id = publish
                    .packet_id
                    .ok_or_else(|| MqttError::ProtocolViolation("missing packet id".to_string()))?;
                let _permit = self.tracker.acquire_publish_token().await?;
                self.backend
                    .publish(self.connection_id, routed(&publish.message))
                    .await?;
                self.write(&Packet::PubAck(PubAckPacket::new(id))).await
            }
            QoS::ExactlyOnce => {
                let id = publish
                    .packet_id
                    .ok_or_else(|| MqttError::ProtocolViolation("missing packet id".to_string()))?;

                // A DUP resend of an exchange already in progress only
                // needs its PUBREC again.
                if !self.tracker.has_inbound(id) {
                    let permit = self.tracker.acquire_publish_token().await?;
                    session.store().save_packet(
                        Direction::Incoming,
                        id,
                        Packet::Publish(publish.clone()),
                    )?;
                    self.tracker.begin_inbound(id, permit);
                }
                self.write(&Packet::PubRec(PubRecPacket::new(id))).await
            }
        }
    }

    async fn handle_pubrel(&mut self, session: &Arc<SessionHandle>, id: u16) -> Result<()> {
        if let Some(Packet::Publish(stored)) =
            session.store().lookup_packet(Direction::Incoming, id)?
        {
            self.backend
                .publish(self.connection_id, routed(&stored.message))
                .await?;
            session.store().delete_packet(Direction::Incoming, id)?;
        }
        self.tracker.complete_inbound(id);

        // A PUBREL for an unknown id is still answered with PUBCOMP.
        self.write(&Packet::PubComp(PubCompPacket::new(id))).await
    }

    async fn handle_subscribe(
        &mut self,
        session: &Arc<SessionHandle>,
        subscribe: SubscribePacket,
    ) -> Result<()> {
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut accepted = Vec::new();

        for subscription in &subscribe.subscriptions {
            if !valid_topic_filter(&subscription.topic) {
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }
            self.backend.subscribe(session, subscription).await?;
            session.store().save_subscription(subscription)?;
            return_codes.push(SubscribeReturnCode::granted(subscription.qos));
            accepted.push(subscription.topic.clone());
        }

        self.write(&Packet::SubAck(SubAckPacket::new(
            subscribe.packet_id,
            return_codes,
        )))
        .await?;

        for topic in accepted {
            self.backend.queue_retained(session, &topic).await?;
        }
        Ok(())
    }

    async fn handle_unsubscribe(
        &mut self,
        session: &Arc<SessionHandle>,
        unsubscribe: UnsubscribePacket,
    ) -> Result<()> {
        for topic in &unsubscribe.topics {
            self.backend.unsubscribe(session, topic).await?;
            session.store().delete_subscription(topic)?;
        }
        self.write(&Packet::UnsubAck(UnsubAckPacket::new(
            unsubscribe.packet_id,
        )))
        .await
    }

    /// Dequeuer duty: write one queued message as PUBLISH at the
    /// minimum of message and subscription QoS.
    async fn send_message(
        &mut self,
        session: &Arc<SessionHandle>,
        message: Message,
        ack: Option<Ack>,
    ) -> Result<()> {
        let qos = match session.store().lookup_subscription(&message.topic)? {
            Some(subscription) => message.qos.min(subscription.qos),
            None => message.qos,
        };

        let mut message = message;
        message.qos = qos;

        if qos == QoS::AtMostOnce {
            self.write(&Packet::Publish(PublishPacket::new(message, None)))
                .await?;
            if let Some(ack) = ack {
                ack();
            }
            return Ok(());
        }

        let permit = self.tracker.acquire_inflight_token().await?;
        let id = session.store().next_id();
        let publish = PublishPacket::new(message, Some(id));
        session
            .store()
            .save_packet(Direction::Outgoing, id, Packet::Publish(publish.clone()))?;
        let phase = match qos {
            QoS::AtLeastOnce => OutboundPhase::AwaitingPubAck,
            _ => OutboundPhase::AwaitingPubRec,
        };
        self.tracker.begin_outbound(id, phase, Some(permit), ack);
        self.write(&Packet::Publish(publish)).await
    }

    /// Publishes the will on abrupt shutdown. Failures are logged and
    /// never block termination.
    async fn publish_will(&mut self, session: &Arc<SessionHandle>) {
        let will = match session.store().lookup_will() {
            Ok(Some(will)) => will,
            Ok(None) => return,
            Err(err) => {
                warn!(client_id = %self.client_id, error = %err, "will lookup failed");
                return;
            }
        };

        debug!(client_id = %self.client_id, topic = %will.topic, "publishing will");

        if will.retain {
            let result = if will.payload.is_empty() {
                self.backend.clear_retained(&will.topic).await
            } else {
                self.backend.store_retained(will.clone()).await
            };
            if let Err(err) = result {
                warn!(client_id = %self.client_id, error = %err, "retaining will failed");
            }
        }

        if let Err(err) = self
            .backend
            .publish(self.connection_id, routed(&will))
            .await
        {
            warn!(client_id = %self.client_id, error = %err, "will publication failed");
        }

        let _ = session.store().clear_will();
    }

    async fn send_connack(&mut self, return_code: ConnectReturnCode) -> Result<()> {
        self.write(&Packet::ConnAck(ConnAckPacket::new(return_code, false)))
            .await
    }

    async fn write(&mut self, packet: &Packet) -> Result<()> {
        write_packet(&mut self.stream, &mut self.write_buf, packet).await
    }
}

/// Copy of a message as forwarded to live subscribers: the retain
/// flag only survives on deliveries from the retained store.
fn routed(message: &Message) -> Message {
    let mut routed = message.clone();
    routed.retain = false;
    routed
}
