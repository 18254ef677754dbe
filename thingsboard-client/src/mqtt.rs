use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, trace, warn};
use uuid::Uuid;

use crate::codec::{ClaimRequest, ProvisionRequest, RpcRequest};
use crate::config::{Connection, SessionConfig};
use crate::error::Error;
use crate::session::{Session, WeakSession};
use crate::subscription::SubscriptionKind;
use crate::util::interrupt::Interrupt;
use crate::util::types::AccessToken;

pub(crate) const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
pub(crate) const ATTRIBUTES_TOPIC: &str = "v1/devices/me/attributes";
pub(crate) const RPC_REQUEST_FILTER: &str = "v1/devices/me/rpc/request/+";
const CLAIM_TOPIC: &str = "v1/devices/me/claim";
const PROVISION_TOPIC: &str = "/provision";

const ATTRIBUTES_REQUEST_PREFIX: &str = "v1/devices/me/attributes/request/";
const ATTRIBUTES_RESPONSE_PREFIX: &str = "v1/devices/me/attributes/response/";
const RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
const RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

// Size of the request queue between the client handle and the event loop
const REQUEST_CAPACITY: usize = 32;

// Back-off after an event loop error, rumqttc reconnects on the next poll
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// What an inbound publish is, going by its topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    AttributesUpdate,
    AttributesReply(u32),
    RpcRequest(u32),
    RpcReply(u32),
}

impl Inbound {
    fn parse(topic: &str) -> Option<Self> {
        if topic == ATTRIBUTES_TOPIC {
            return Some(Inbound::AttributesUpdate);
        }

        let id = |prefix: &str| topic.strip_prefix(prefix).and_then(|id| id.parse().ok());
        if let Some(id) = id(ATTRIBUTES_RESPONSE_PREFIX) {
            Some(Inbound::AttributesReply(id))
        } else if let Some(id) = id(RPC_REQUEST_PREFIX) {
            Some(Inbound::RpcRequest(id))
        } else {
            id(RPC_RESPONSE_PREFIX).map(Inbound::RpcReply)
        }
    }
}

/// A reply the session is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Reply {
    Attributes(u32),
    Rpc(u32),
}

impl Reply {
    fn id(&self) -> u32 {
        match self {
            Reply::Attributes(id) | Reply::Rpc(id) => *id,
        }
    }

    fn request_topic(&self) -> String {
        match self {
            Reply::Attributes(id) => format!("{ATTRIBUTES_REQUEST_PREFIX}{id}"),
            Reply::Rpc(id) => format!("{RPC_REQUEST_PREFIX}{id}"),
        }
    }

    fn reply_topic(&self) -> String {
        match self {
            Reply::Attributes(id) => format!("{ATTRIBUTES_RESPONSE_PREFIX}{id}"),
            Reply::Rpc(id) => format!("{RPC_RESPONSE_PREFIX}{id}"),
        }
    }
}

/// Correlation table of outstanding requests
#[derive(Clone, Default)]
struct Pending(Arc<Mutex<HashMap<Reply, oneshot::Sender<()>>>>);

impl Pending {
    fn register(&self, reply: Reply) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reply, tx);
        if previous.is_some() {
            warn!(id = reply.id(), "request id reused while a reply was outstanding");
        }
        rx
    }

    fn take(&self, reply: &Reply) -> Option<oneshot::Sender<()>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reply)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Route an inbound publish to the matching session callback
fn dispatch(pending: &Pending, session: &Session, topic: &str, payload: &str) {
    let Some(inbound) = Inbound::parse(topic) else {
        trace!(topic, "ignoring publish on unknown topic");
        return;
    };

    let callbacks = session.callbacks();
    match inbound {
        Inbound::AttributesUpdate => {
            let delivered = session
                .subscription(SubscriptionKind::Attributes)
                .deliver(|| {
                    if let Some(cb) = callbacks.attributes_update() {
                        cb(session, payload);
                    }
                });
            if !delivered {
                trace!("attributes subscription inactive, dropping update");
            }
        }
        Inbound::RpcRequest(id) => {
            let delivered = session.subscription(SubscriptionKind::Rpc).deliver(|| {
                if let Some(cb) = callbacks.rpc_request() {
                    cb(session, payload, id);
                }
            });
            if !delivered {
                trace!(id, "rpc subscription inactive, dropping request");
            }
        }
        Inbound::AttributesReply(id) => {
            let Some(done) = pending.take(&Reply::Attributes(id)) else {
                debug!(id, "dropping unsolicited attributes reply");
                return;
            };
            if let Some(cb) = callbacks.attributes_reply() {
                cb(session, payload);
            }
            let _ = done.send(());
        }
        Inbound::RpcReply(id) => {
            let Some(done) = pending.take(&Reply::Rpc(id)) else {
                debug!(id, "dropping unsolicited rpc reply");
                return;
            };
            if let Some(cb) = callbacks.rpc_reply() {
                cb(session, payload);
            }
            let _ = done.send(());
        }
    }
}

/// Map a failed connection attempt, a refused token is reported as such
fn handshake_error(err: ConnectionError) -> Error {
    match err {
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword,
        ) => Error::Unauthorized,
        e => Error::from(e),
    }
}

/// Push binding over an MQTT connection
#[derive(Clone)]
pub(crate) struct MqttLink {
    client: AsyncClient,
    token: AccessToken,
    pending: Pending,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
    interrupt: Interrupt,
}

impl MqttLink {
    /// Open the connection and start delivering inbound messages to `session`.
    ///
    /// Returns once the broker has accepted the connection.
    pub async fn connect(
        conn: &Connection,
        config: &SessionConfig,
        session: WeakSession,
    ) -> Result<Self, Error> {
        let client_id = format!("tb-{}", Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, conn.host.as_str(), conn.port);
        options.set_keep_alive(config.keep_alive);
        options.set_credentials(conn.token.as_str(), "");

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(handshake_error(e)),
                }
            }
        };
        tokio::time::timeout(config.request_timeout, handshake)
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        debug!(host = %conn.host, port = conn.port, "connected");

        let link = Self::from_client(client, conn.token.clone());
        let driver = tokio::spawn(
            drive(
                eventloop,
                link.pending.clone(),
                session,
                link.interrupt.clone(),
            )
            .instrument(info_span!("mqtt_event_loop")),
        );
        *link.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);

        Ok(link)
    }

    pub(crate) fn from_client(client: AsyncClient, token: AccessToken) -> Self {
        Self {
            client,
            token,
            pending: Pending::default(),
            driver: Arc::new(Mutex::new(None)),
            interrupt: Interrupt::new(),
        }
    }

    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    pub async fn publish(&self, topic: &str, payload: String) -> Result<(), Error> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;
        trace!(topic, "published");
        Ok(())
    }

    pub async fn subscribe(&self, filter: &str) -> Result<(), Error> {
        self.client.subscribe(filter, QoS::AtMostOnce).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    pub async fn rpc_reply(&self, id: u32, response: &str) -> Result<(), Error> {
        self.publish(&format!("{RPC_RESPONSE_PREFIX}{id}"), response.to_owned())
            .await
    }

    pub async fn claim(&self, request: &ClaimRequest<'_>) -> Result<(), Error> {
        self.publish(CLAIM_TOPIC, serde_json::to_string(request)?)
            .await
    }

    pub async fn provision(&self, request: &ProvisionRequest<'_>) -> Result<(), Error> {
        self.publish(PROVISION_TOPIC, serde_json::to_string(request)?)
            .await
    }

    pub async fn rpc_send(
        &self,
        id: u32,
        request: &RpcRequest<'_>,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.request(Reply::Rpc(id), serde_json::to_string(request)?, timeout)
            .await
    }

    pub async fn request_attributes(
        &self,
        id: u32,
        payload: String,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.request(Reply::Attributes(id), payload, timeout).await
    }

    /// Publish a request and wait for the reply published under the same id.
    ///
    /// The reply topic is unsubscribed whatever the outcome.
    async fn request(&self, reply: Reply, payload: String, timeout: Duration) -> Result<(), Error> {
        let reply_topic = reply.reply_topic();
        let done = self.pending.register(reply);

        let result = async {
            self.subscribe(&reply_topic).await?;
            self.publish(&reply.request_topic(), payload).await?;
            tokio::time::timeout(timeout, done)
                .await
                .map_err(|_| Error::ReplyTimeout(reply.id()))?
                .map_err(|_| Error::ReplyTimeout(reply.id()))
        }
        .await;

        self.pending.take(&reply);
        if let Err(e) = self.unsubscribe(&reply_topic).await {
            warn!(topic = %reply_topic, "failed to unsubscribe from reply topic: {e}");
        }
        result
    }

    #[cfg(test)]
    pub fn is_halted(&self) -> bool {
        self.interrupt.is_triggered()
    }

    /// Handle an inbound publish as if it came from the broker
    pub fn dispatch(&self, session: &Session, topic: &str, payload: &str) {
        dispatch(&self.pending, session, topic, payload)
    }

    /// Disconnect from the broker and wait for the event loop to wind down.
    ///
    /// The loop is interrupted if it does not stop within `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        if let Err(e) = self.client.disconnect().await {
            debug!("failed to queue disconnect: {e}");
        }

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(timeout, &mut driver).await.is_err() {
                warn!("event loop did not stop in time, interrupting");
                self.interrupt.trigger();
            }
        }
    }

    /// Stop the event loop without a disconnect handshake
    pub fn halt(&self) {
        self.interrupt.trigger();
    }
}

async fn drive(mut eventloop: EventLoop, pending: Pending, session: WeakSession, interrupt: Interrupt) {
    loop {
        let event = tokio::select! {
            _ = interrupt.wait() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(session) = session.upgrade() else {
                    debug!("session dropped, stopping");
                    break;
                };
                let payload = String::from_utf8_lossy(&publish.payload);
                dispatch(&pending, &session, &publish.topic, &payload);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("connection error: {e}");
                tokio::select! {
                    _ = interrupt.wait() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rumqttc::Request;

    use super::*;
    use crate::error::Code;

    #[test]
    fn it_classifies_inbound_topics() {
        assert_eq!(
            Inbound::parse("v1/devices/me/attributes"),
            Some(Inbound::AttributesUpdate)
        );
        assert_eq!(
            Inbound::parse("v1/devices/me/attributes/response/5"),
            Some(Inbound::AttributesReply(5))
        );
        assert_eq!(
            Inbound::parse("v1/devices/me/rpc/request/42"),
            Some(Inbound::RpcRequest(42))
        );
        assert_eq!(
            Inbound::parse("v1/devices/me/rpc/response/7"),
            Some(Inbound::RpcReply(7))
        );
    }

    #[test]
    fn it_ignores_unknown_topics() {
        assert_eq!(Inbound::parse("v1/devices/me/telemetry"), None);
        assert_eq!(Inbound::parse("v1/devices/me/rpc/request/abc"), None);
        assert_eq!(Inbound::parse("v1/devices/me/attributes/response/"), None);
        assert_eq!(Inbound::parse("v1/devices/me/attributesx"), None);
    }

    #[test]
    fn it_builds_request_and_reply_topics_from_the_id() {
        let reply = Reply::Attributes(12);
        assert_eq!(reply.request_topic(), "v1/devices/me/attributes/request/12");
        assert_eq!(reply.reply_topic(), "v1/devices/me/attributes/response/12");

        let reply = Reply::Rpc(3);
        assert_eq!(reply.request_topic(), "v1/devices/me/rpc/request/3");
        assert_eq!(reply.reply_topic(), "v1/devices/me/rpc/response/3");
    }

    #[test]
    fn it_reports_refused_credentials_as_unauthorized() {
        for code in [
            ConnectReturnCode::NotAuthorized,
            ConnectReturnCode::BadUserNamePassword,
        ] {
            let err = handshake_error(ConnectionError::ConnectionRefused(code));
            assert!(matches!(err, Error::Unauthorized));
            assert_eq!(err.code(), Code::Unauthorized);
        }
    }

    #[test]
    fn it_reports_other_refusals_as_unknown_errors() {
        let err = handshake_error(ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable,
        ));
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectionRefused(
                ConnectReturnCode::ServiceUnavailable
            ))
        ));
        assert_eq!(err.code(), Code::UnknownError);
    }

    #[tokio::test]
    async fn test_request_times_out_and_cleans_up() {
        let (tx, rx) = flume::unbounded();
        let link = MqttLink::from_client(AsyncClient::from_senders(tx), "tok".parse().unwrap());

        let err = link
            .request_attributes(9, "{}".to_owned(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReplyTimeout(9)));
        assert!(link.pending.is_empty());

        let requests: Vec<Request> = rx.drain().collect();
        assert!(matches!(
            &requests[0],
            Request::Subscribe(s) if s.filters[0].path == "v1/devices/me/attributes/response/9"
        ));
        assert!(matches!(
            &requests[1],
            Request::Publish(p) if p.topic == "v1/devices/me/attributes/request/9"
                && &p.payload[..] == b"{}"
        ));
        assert!(matches!(
            &requests[2],
            Request::Unsubscribe(u) if u.topics == vec!["v1/devices/me/attributes/response/9".to_owned()]
        ));
    }

    #[tokio::test]
    async fn test_claim_publishes_only_given_fields() {
        let (tx, rx) = flume::unbounded();
        let link = MqttLink::from_client(AsyncClient::from_senders(tx), "tok".parse().unwrap());

        link.claim(&ClaimRequest::new(None, -1)).await.unwrap();

        match rx.try_recv().unwrap() {
            Request::Publish(p) => {
                assert_eq!(p.topic, "v1/devices/me/claim");
                assert_eq!(p.payload.as_ref(), b"{}");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }
}
