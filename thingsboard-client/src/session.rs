use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::callbacks::{Callback, Callbacks, RpcRequestCallback};
use crate::codec::{self, AttributesQuery, ClaimRequest, ProvisionRequest, RpcRequest};
use crate::config::{Connection, SessionConfig};
use crate::error::Error;
use crate::http::{Endpoint, HttpLink};
use crate::mqtt::{self, MqttLink};
use crate::subscription::{Subscription, SubscriptionKind, SubscriptionState};
use crate::util::http::Client;
use crate::util::types::AccessToken;

/// Wire transport used by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Push delivery over an MQTT connection
    Mqtt,
    /// Request/response calls against the HTTP device API, subscriptions
    /// are emulated with long-polling
    Http,
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Transport::Mqtt),
            "http" => Ok(Transport::Http),
            _ => Err(Error::UnknownTransport(s.to_owned())),
        }
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Mqtt => f.write_str("mqtt"),
            Transport::Http => f.write_str("http"),
        }
    }
}

/// The binding a connected session talks through
#[derive(Clone)]
pub(crate) enum Link {
    Mqtt(MqttLink),
    Http(HttpLink),
}

struct Inner {
    transport: Transport,
    config: SessionConfig,
    // only allocated for HTTP sessions, MQTT clients are created on connect
    http: Option<Client>,
    link: RwLock<Option<Link>>,
    callbacks: Callbacks,
    attributes: Arc<Subscription>,
    rpc: Arc<Subscription>,
}

// Background delivery only holds weak references, stop it along with the
// last handle
impl Drop for Inner {
    fn drop(&mut self) {
        self.attributes.request_teardown();
        self.rpc.request_teardown();

        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(Link::Mqtt(mqtt)) = link.take() {
            mqtt.halt();
        }
    }
}

/// A device session with the platform.
///
/// `Session` is a cheap handle, clones refer to the same session. This
/// allows callbacks, which receive the session by reference, to move a
/// clone into a task, e.g. to answer an RPC.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// Non-owning reference held by background tasks
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<Inner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    /// Create a session for `transport` with the default timings
    pub fn init(transport: Transport) -> Result<Self, Error> {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: Transport, config: SessionConfig) -> Result<Self, Error> {
        let http = match transport {
            Transport::Http => Some(Client::try_new(Some(config.request_timeout))?),
            Transport::Mqtt => None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                config,
                http,
                link: RwLock::new(None),
                callbacks: Callbacks::default(),
                attributes: Arc::new(Subscription::new(SubscriptionKind::Attributes)),
                rpc: Arc::new(Subscription::new(SubscriptionKind::Rpc)),
            }),
        })
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn subscription_state(&self, kind: SubscriptionKind) -> SubscriptionState {
        self.subscription(kind).state()
    }

    pub(crate) fn subscription(&self, kind: SubscriptionKind) -> &Arc<Subscription> {
        match kind {
            SubscriptionKind::Attributes => &self.inner.attributes,
            SubscriptionKind::Rpc => &self.inner.rpc,
        }
    }

    pub(crate) fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    fn link(&self) -> Result<Link, Error> {
        self.inner
            .link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Store `link` unless the session got connected in the meantime
    fn attach(&self, link: Link) -> Result<(), Link> {
        let mut current = self
            .inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return Err(link);
        }
        *current = Some(link);
        Ok(())
    }

    /// Connect the session to the platform at `host:port`, authenticating
    /// with the device access token.
    ///
    /// For MQTT this performs the broker handshake and starts the delivery
    /// loop. Over HTTP no call is made, the routing parameters are only
    /// validated and stored.
    #[instrument(skip(self, token), fields(transport = %self.inner.transport))]
    pub async fn connect(&self, host: &str, port: u16, token: &str) -> Result<(), Error> {
        if host.is_empty() {
            return Err(Error::InvalidArgument("host cannot be empty"));
        }
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let conn = Connection {
            host: host.to_owned(),
            port,
            token: token.parse::<AccessToken>()?,
        };

        let link = match &self.inner.http {
            Some(client) => Link::Http(HttpLink::new(client.clone(), &conn, &self.inner.config)?),
            None => Link::Mqtt(MqttLink::connect(&conn, &self.inner.config, self.downgrade()).await?),
        };

        if let Err(link) = self.attach(link) {
            if let Link::Mqtt(mqtt) = link {
                mqtt.stop(self.inner.config.request_timeout).await;
            }
            return Err(Error::AlreadyConnected);
        }

        info!("connected");
        Ok(())
    }

    /// Publish a telemetry document.
    ///
    /// Over MQTT `topic` overrides the default telemetry topic, it is
    /// ignored over HTTP.
    #[instrument(skip_all)]
    pub async fn send_telemetry(&self, data: &str, topic: Option<&str>) -> Result<(), Error> {
        let result = match self.link()? {
            Link::Mqtt(mqtt) => {
                mqtt.publish(topic.unwrap_or(mqtt::TELEMETRY_TOPIC), data.to_owned())
                    .await
            }
            Link::Http(http) => http.send(Endpoint::Telemetry, data).await,
        };
        result.inspect_err(|e| warn!("failed to send telemetry: {e}"))
    }

    /// Publish client-side attributes
    #[instrument(skip_all)]
    pub async fn publish_attributes(&self, data: &str) -> Result<(), Error> {
        let result = match self.link()? {
            Link::Mqtt(mqtt) => mqtt.publish(mqtt::ATTRIBUTES_TOPIC, data.to_owned()).await,
            Link::Http(http) => http.send(Endpoint::Attributes, data).await,
        };
        result.inspect_err(|e| warn!("failed to publish attributes: {e}"))
    }

    /// Fetch attribute values, handing the reply to `callback`.
    ///
    /// Returns once the reply has been delivered, or with
    /// [Error::ReplyTimeout] if an MQTT reply does not arrive in time.
    #[instrument(skip(self, query, callback))]
    pub async fn request_attributes<F>(
        &self,
        id: u32,
        query: &AttributesQuery,
        callback: F,
    ) -> Result<(), Error>
    where
        F: Fn(&Session, &str) + Send + Sync + 'static,
    {
        let link = self.link()?;
        let callback: Callback = Arc::new(callback);
        self.inner.callbacks.set_attributes_reply(callback.clone());

        let result = match link {
            Link::Mqtt(mqtt) => {
                let payload = serde_json::to_string(query)?;
                mqtt.request_attributes(id, payload, self.inner.config.reply_timeout)
                    .await
            }
            Link::Http(http) => http
                .request_attributes(query)
                .await
                .map(|body| callback(self, &body)),
        };
        result.inspect_err(|e| warn!("attributes request failed: {e}"))
    }

    /// Start receiving shared attribute updates.
    ///
    /// `timeout` is the long-poll timeout over HTTP, MQTT pushes updates as
    /// they happen and ignores it. Fails with [Error::AlreadyActive] if the
    /// subscription is already running.
    #[instrument(skip_all)]
    pub async fn subscribe_attributes<F>(&self, timeout: Duration, callback: F) -> Result<(), Error>
    where
        F: Fn(&Session, &str) + Send + Sync + 'static,
    {
        let link = self.link()?;
        let callback: Callback = Arc::new(callback);
        let subscription = self.subscription(SubscriptionKind::Attributes);
        let interrupt =
            subscription.activate(|| self.inner.callbacks.set_attributes_update(callback))?;

        match link {
            Link::Mqtt(mqtt) => {
                if let Err(e) = mqtt.subscribe(mqtt::ATTRIBUTES_TOPIC).await {
                    warn!("failed to subscribe to attribute updates: {e}");
                    subscription.request_teardown();
                    subscription.mark_cleaned();
                    return Err(e);
                }
            }
            Link::Http(http) => {
                let session = self.downgrade();
                let subscription = Arc::clone(subscription);
                tokio::spawn(
                    async move {
                        http.long_poll(Endpoint::AttributeUpdates, timeout, &interrupt, |body| {
                            let Some(session) = session.upgrade() else {
                                return;
                            };
                            subscription.deliver(|| {
                                if let Some(cb) = session.callbacks().attributes_update() {
                                    cb(&session, body);
                                }
                            });
                        })
                        .await;
                        subscription.mark_cleaned();
                    }
                    .instrument(info_span!("attributes_poll")),
                );
            }
        }

        debug!("subscribed to attribute updates");
        Ok(())
    }

    /// Stop receiving attribute updates.
    ///
    /// Waits until delivery has stopped, no callback runs once this returns.
    #[instrument(skip_all)]
    pub async fn unsubscribe_attributes(&self) -> Result<(), Error> {
        self.unsubscribe(SubscriptionKind::Attributes, mqtt::ATTRIBUTES_TOPIC)
            .await
    }

    /// Start receiving server-side RPC calls.
    ///
    /// The callback gets the id to pass to [Session::rpc_reply].
    #[instrument(skip_all)]
    pub async fn subscribe_rpc<F>(&self, timeout: Duration, callback: F) -> Result<(), Error>
    where
        F: Fn(&Session, &str, u32) + Send + Sync + 'static,
    {
        let link = self.link()?;
        let callback: RpcRequestCallback = Arc::new(callback);
        let subscription = self.subscription(SubscriptionKind::Rpc);
        let interrupt = subscription.activate(|| self.inner.callbacks.set_rpc_request(callback))?;

        match link {
            Link::Mqtt(mqtt) => {
                if let Err(e) = mqtt.subscribe(mqtt::RPC_REQUEST_FILTER).await {
                    warn!("failed to subscribe to rpc requests: {e}");
                    subscription.request_teardown();
                    subscription.mark_cleaned();
                    return Err(e);
                }
            }
            Link::Http(http) => {
                let session = self.downgrade();
                let subscription = Arc::clone(subscription);
                tokio::spawn(
                    async move {
                        http.long_poll(Endpoint::Rpc, timeout, &interrupt, |body| {
                            let id = match codec::rpc_request_id(body) {
                                Ok(id) => id,
                                Err(e) => {
                                    warn!("dropping malformed rpc request: {e}");
                                    return;
                                }
                            };
                            let Some(session) = session.upgrade() else {
                                return;
                            };
                            subscription.deliver(|| {
                                if let Some(cb) = session.callbacks().rpc_request() {
                                    cb(&session, body, id);
                                }
                            });
                        })
                        .await;
                        subscription.mark_cleaned();
                    }
                    .instrument(info_span!("rpc_poll")),
                );
            }
        }

        debug!("subscribed to rpc requests");
        Ok(())
    }

    /// Stop receiving server-side RPC calls, waiting for delivery to stop
    #[instrument(skip_all)]
    pub async fn unsubscribe_rpc(&self) -> Result<(), Error> {
        self.unsubscribe(SubscriptionKind::Rpc, mqtt::RPC_REQUEST_FILTER)
            .await
    }

    async fn unsubscribe(&self, kind: SubscriptionKind, filter: &str) -> Result<(), Error> {
        let subscription = self.subscription(kind);
        let mut result = Ok(());

        // MQTT delivery runs on the shared event loop, there is no
        // dedicated task to wait for. A callback already running there
        // still holds off wait_cleaned until it returns.
        if subscription.request_teardown() && self.inner.transport == Transport::Mqtt {
            if let Ok(Link::Mqtt(mqtt)) = self.link() {
                result = mqtt.unsubscribe(filter).await;
            }
            subscription.mark_cleaned();
        }

        subscription.wait_cleaned().await;
        debug!(%kind, "unsubscribed");
        result
    }

    /// Call a method on the server, handing its result to `callback`.
    ///
    /// `params` is passed through as a string.
    #[instrument(skip(self, params, callback))]
    pub async fn rpc_send<F>(
        &self,
        id: u32,
        method: &str,
        params: &str,
        callback: F,
    ) -> Result<(), Error>
    where
        F: Fn(&Session, &str) + Send + Sync + 'static,
    {
        let link = self.link()?;
        let callback: Callback = Arc::new(callback);
        self.inner.callbacks.set_rpc_reply(callback.clone());

        let request = RpcRequest::new(method, params);
        let result = match link {
            Link::Mqtt(mqtt) => {
                mqtt.rpc_send(id, &request, self.inner.config.reply_timeout)
                    .await
            }
            Link::Http(http) => http
                .rpc_send(&request.with_id(id))
                .await
                .map(|body| callback(self, &body)),
        };
        result.inspect_err(|e| warn!("rpc call failed: {e}"))
    }

    /// Answer the server-side RPC call `id`
    #[instrument(skip(self, response))]
    pub async fn rpc_reply(&self, id: u32, response: &str) -> Result<(), Error> {
        let result = match self.link()? {
            Link::Mqtt(mqtt) => mqtt.rpc_reply(id, response).await,
            Link::Http(http) => http.rpc_reply(id, response).await,
        };
        result.inspect_err(|e| warn!("failed to reply to rpc: {e}"))
    }

    /// Start the claiming window for this device.
    ///
    /// A negative `duration_ms` leaves the duration to the server.
    #[instrument(skip_all)]
    pub async fn claim_device(&self, secret: Option<&str>, duration_ms: i64) -> Result<(), Error> {
        let request = ClaimRequest::new(secret, duration_ms);
        let result = match self.link()? {
            Link::Mqtt(mqtt) => mqtt.claim(&request).await,
            Link::Http(http) => http.claim(&request).await,
        };
        result.inspect_err(|e| warn!("failed to claim device: {e}"))
    }

    /// Provision the device with the session's access token
    #[instrument(skip_all)]
    pub async fn provision_device(&self, key: &str, secret: &str) -> Result<(), Error> {
        if key.is_empty() || secret.is_empty() {
            return Err(Error::InvalidArgument("provisioning key and secret are required"));
        }

        let result = match self.link()? {
            Link::Mqtt(mqtt) => {
                let request = ProvisionRequest::new(key, secret, mqtt.token());
                mqtt.provision(&request).await
            }
            Link::Http(http) => {
                let request = ProvisionRequest::new(key, secret, http.token());
                http.provision(&request).await
            }
        };
        result.inspect_err(|e| warn!("failed to provision device: {e}"))
    }

    /// Wait until no subscription is running
    pub async fn wait_idle(&self) {
        self.inner.attributes.wait_cleaned().await;
        self.inner.rpc.wait_cleaned().await;
    }

    /// Close the connection.
    ///
    /// Subscriptions are asked to stop but this does not wait for HTTP
    /// poll loops to finish, unsubscribe first for that.
    #[instrument(skip_all)]
    pub async fn disconnect(&self) -> Result<(), Error> {
        let link = self
            .inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.inner.attributes.request_teardown();
        self.inner.rpc.request_teardown();

        match link {
            Some(Link::Mqtt(mqtt)) => {
                mqtt.stop(self.inner.config.request_timeout).await;
                self.inner.attributes.mark_cleaned();
                self.inner.rpc.mark_cleaned();
            }
            Some(Link::Http(_)) => {}
            None => return Err(Error::NotConnected),
        }

        info!("disconnected");
        Ok(())
    }

    /// Release the session, disconnecting it first if needed
    #[instrument(skip_all)]
    pub async fn cleanup(self) {
        if self.is_connected() {
            // the only failure is not being connected
            let _ = self.disconnect().await;
        }
        self.inner.attributes.request_teardown();
        self.inner.rpc.request_teardown();
    }
}
