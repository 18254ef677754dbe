use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::codec::{AttributesQuery, ClaimRequest, ProvisionRequest, RpcRequest};
use crate::config::{Connection, SessionConfig};
use crate::error::Error;
use crate::util::http::{Client, Method, Response, StatusCode, Uri};
use crate::util::interrupt::Interrupt;
use crate::util::types::AccessToken;

/// Device API endpoints, relative to `/api/v1/<token>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Telemetry,
    Attributes,
    AttributeUpdates,
    Rpc,
    Claim,
}

impl Endpoint {
    fn segments(&self) -> &'static [&'static str] {
        match self {
            Endpoint::Telemetry => &["telemetry"],
            Endpoint::Attributes => &["attributes"],
            Endpoint::AttributeUpdates => &["attributes", "updates"],
            Endpoint::Rpc => &["rpc"],
            Endpoint::Claim => &["claim"],
        }
    }
}

const PROVISION_PATH: &[&str] = &["api", "v1", "provision"];

/// Poll binding over the HTTP device API
#[derive(Clone)]
pub(crate) struct HttpLink {
    client: Client,
    base: Uri,
    token: AccessToken,
    request_timeout: Duration,
    poll_interval: Duration,
}

impl HttpLink {
    pub fn new(client: Client, conn: &Connection, config: &SessionConfig) -> Result<Self, Error> {
        Ok(Self {
            client,
            base: Uri::from_host(&conn.host, conn.port)?,
            token: conn.token.clone(),
            request_timeout: config.request_timeout,
            poll_interval: config.poll_interval,
        })
    }

    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    /// URI of a path below `/api/v1/<token>`, the token is percent-encoded
    fn uri(&self, path: &[&str], query: Option<&str>) -> Result<Uri, Error> {
        let mut segments = vec!["api", "v1", self.token.as_str()];
        segments.extend_from_slice(path);
        Ok(Uri::from_segments(&self.base, &segments, query)?)
    }

    async fn post(&self, uri: &Uri, payload: String) -> Result<Response, Error> {
        let res = self.client.post_json(uri, payload).await?.error_for_status()?;
        trace!(path = uri.path(), status = %res.status(), "posted");
        Ok(res)
    }

    /// POST a caller supplied JSON document, sent as-is
    pub async fn send(&self, endpoint: Endpoint, payload: &str) -> Result<(), Error> {
        let uri = self.uri(endpoint.segments(), None)?;
        self.post(&uri, payload.to_owned()).await?;
        Ok(())
    }

    pub async fn request_attributes(&self, query: &AttributesQuery) -> Result<String, Error> {
        let uri = self.uri(Endpoint::Attributes.segments(), None)?;
        let pairs = query.query_pairs();
        let res = self
            .client
            .request(Method::GET, &uri, |req| Ok(req.query(&pairs)))
            .await?
            .error_for_status()?;
        Ok(res.text().await?)
    }

    pub async fn rpc_send(&self, request: &RpcRequest<'_>) -> Result<String, Error> {
        let uri = self.uri(Endpoint::Rpc.segments(), None)?;
        let res = self.post(&uri, serde_json::to_string(request)?).await?;
        Ok(res.text().await?)
    }

    pub async fn rpc_reply(&self, id: u32, response: &str) -> Result<(), Error> {
        let id = id.to_string();
        let uri = self.uri(&["rpc", id.as_str()], None)?;
        self.post(&uri, response.to_owned()).await?;
        Ok(())
    }

    pub async fn claim(&self, request: &ClaimRequest<'_>) -> Result<(), Error> {
        let uri = self.uri(Endpoint::Claim.segments(), None)?;
        self.post(&uri, serde_json::to_string(request)?).await?;
        Ok(())
    }

    pub async fn provision(&self, request: &ProvisionRequest<'_>) -> Result<(), Error> {
        let uri = Uri::from_segments(&self.base, PROVISION_PATH, None)?;
        self.post(&uri, serde_json::to_string(request)?).await?;
        Ok(())
    }

    /// Long-poll `endpoint` until interrupted or until the server stops
    /// answering with content.
    ///
    /// `deliver` is called with every payload that differs from the one
    /// before it. An expired long-poll (408) is not a payload and the call is
    /// simply re-issued. The interrupt is checked between calls and cuts the
    /// wait between them short, an in-flight call is not cancelled.
    pub async fn long_poll<F>(
        &self,
        endpoint: Endpoint,
        timeout: Duration,
        interrupt: &Interrupt,
        mut deliver: F,
    ) where
        F: FnMut(&str),
    {
        let query = format!("timeout={}", timeout.as_millis());
        let uri = match self.uri(endpoint.segments(), Some(&query)) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("cannot build long-poll URI: {e}");
                return;
            }
        };
        let call_timeout = self.request_timeout + timeout;

        let mut last: Option<String> = None;
        loop {
            if interrupt.is_triggered() {
                break;
            }

            let res = self
                .client
                .request(Method::GET, &uri, |req| Ok(req.timeout(call_timeout)))
                .await;

            let body = match res {
                Ok(res) if res.status() == StatusCode::REQUEST_TIMEOUT => {
                    trace!("long-poll expired");
                    None
                }
                Ok(res) => match res.error_for_status() {
                    Ok(res) => match res.text().await {
                        Ok(body) => Some(body),
                        Err(e) => {
                            warn!("failed to read long-poll response: {e}");
                            break;
                        }
                    },
                    Err(e) => {
                        warn!("long-poll failed: {e}");
                        break;
                    }
                },
                Err(e) => {
                    warn!("long-poll failed: {e}");
                    break;
                }
            };

            if let Some(body) = body {
                if body.is_empty() {
                    debug!("long-poll returned no content, stopping");
                    break;
                }
                if interrupt.is_triggered() {
                    break;
                }
                if last.as_deref() == Some(body.as_str()) {
                    trace!("payload unchanged, skipping");
                } else {
                    deliver(&body);
                    last = Some(body);
                }
            }

            tokio::select! {
                _ = interrupt.wait() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::*;

    fn link(server: &Server, config: SessionConfig) -> HttpLink {
        link_with_token(server, config, "tok")
    }

    fn link_with_token(server: &Server, config: SessionConfig, token: &str) -> HttpLink {
        let addr = server.socket_address();
        let conn = Connection {
            host: addr.ip().to_string(),
            port: addr.port(),
            token: token.parse().unwrap(),
        };
        let client = Client::try_new(Some(config.request_timeout)).unwrap();
        HttpLink::new(client, &conn, &config).unwrap()
    }

    fn fast() -> SessionConfig {
        SessionConfig {
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_posts_the_payload_as_is() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tok/telemetry")
            .match_header("content-type", "application/json")
            .match_body(r#"{"temperature":42"#)
            .with_status(200)
            .create_async()
            .await;

        let link = link(&server, fast());
        // not validated on the way out
        link.send(Endpoint::Telemetry, r#"{"temperature":42"#)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_is_encoded_as_a_single_path_segment() {
        let mut server = Server::new_async().await;
        let telemetry = server
            .mock("POST", "/api/v1/dev%2001%2Fa/telemetry")
            .with_status(200)
            .create_async()
            .await;
        let reply = server
            .mock("POST", "/api/v1/dev%2001%2Fa/rpc/7")
            .with_status(200)
            .create_async()
            .await;

        let link = link_with_token(&server, fast(), "dev 01/a");
        link.send(Endpoint::Telemetry, "{}").await.unwrap();
        link.rpc_reply(7, "{}").await.unwrap();

        telemetry.assert_async().await;
        reply.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_requests_are_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/v1/tok/attributes")
            .with_status(401)
            .create_async()
            .await;

        let link = link(&server, fast());
        let err = link
            .send(Endpoint::Attributes, r#"{"model":"x1"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }

    #[tokio::test]
    async fn test_request_attributes_passes_key_filters() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/tok/attributes")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("clientKeys".into(), "model,serial".into()),
                Matcher::UrlEncoded("sharedKeys".into(), "fw_version".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"client":{"model":"x1"},"shared":{"fw_version":"1.0"}}"#)
            .create_async()
            .await;

        let link = link(&server, fast());
        let query = AttributesQuery::default()
            .client_keys("model,serial")
            .shared_keys("fw_version");
        let body = link.request_attributes(&query).await.unwrap();

        assert_eq!(
            body,
            r#"{"client":{"model":"x1"},"shared":{"fw_version":"1.0"}}"#
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_send_embeds_the_id_in_the_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tok/rpc")
            .match_body(Matcher::Json(
                json!({"id": 3, "method": "getTime", "params": "{}"}),
            ))
            .with_status(200)
            .with_body(r#"{"time":"2026-10-19T10:00:00Z"}"#)
            .create_async()
            .await;

        let link = link(&server, fast());
        let body = link
            .rpc_send(&RpcRequest::new("getTime", "{}").with_id(3))
            .await
            .unwrap();

        assert_eq!(body, r#"{"time":"2026-10-19T10:00:00Z"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_reply_targets_the_request_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tok/rpc/42")
            .match_body(r#"{"response":"OK"}"#)
            .with_status(200)
            .create_async()
            .await;

        let link = link(&server, fast());
        link.rpc_reply(42, r#"{"response":"OK"}"#).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provisioning_is_not_scoped_to_the_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/provision")
            .match_body(Matcher::Json(json!({
                "provisionDeviceKey": "key",
                "provisionDeviceSecret": "secret",
                "token": "tok",
                "credentialsType": "ACCESS_TOKEN",
            })))
            .with_status(200)
            .create_async()
            .await;

        let link = link(&server, fast());
        link.provision(&ProvisionRequest::new("key", "secret", "tok"))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_long_poll_skips_repeated_payloads() {
        let mut server = Server::new_async().await;
        let query = Matcher::UrlEncoded("timeout".into(), "100".into());
        let first = server
            .mock("GET", "/api/v1/tok/attributes/updates")
            .match_query(query.clone())
            .with_status(200)
            .with_body(r#"{"fw_version":"1.0"}"#)
            .expect(2)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/api/v1/tok/attributes/updates")
            .match_query(query.clone())
            .with_status(200)
            .with_body(r#"{"fw_version":"1.1"}"#)
            .expect(1)
            .create_async()
            .await;
        let done = server
            .mock("GET", "/api/v1/tok/attributes/updates")
            .match_query(query)
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let link = link(&server, fast());
        let mut seen = Vec::new();
        link.long_poll(
            Endpoint::AttributeUpdates,
            Duration::from_millis(100),
            &Interrupt::new(),
            |body| seen.push(body.to_owned()),
        )
        .await;

        assert_eq!(seen, vec![r#"{"fw_version":"1.0"}"#, r#"{"fw_version":"1.1"}"#]);
        first.assert_async().await;
        second.assert_async().await;
        done.assert_async().await;
    }

    #[tokio::test]
    async fn test_long_poll_reissues_expired_calls() {
        let mut server = Server::new_async().await;
        let expired = server
            .mock("GET", "/api/v1/tok/rpc")
            .match_query(Matcher::UrlEncoded("timeout".into(), "50".into()))
            .with_status(408)
            .expect(2)
            .create_async()
            .await;
        let failed = server
            .mock("GET", "/api/v1/tok/rpc")
            .match_query(Matcher::UrlEncoded("timeout".into(), "50".into()))
            .with_status(500)
            .create_async()
            .await;

        let link = link(&server, fast());
        let mut calls = 0;
        link.long_poll(
            Endpoint::Rpc,
            Duration::from_millis(50),
            &Interrupt::new(),
            |_| calls += 1,
        )
        .await;

        assert_eq!(calls, 0);
        expired.assert_async().await;
        failed.assert_async().await;
    }

    #[tokio::test]
    async fn test_long_poll_stops_when_interrupted() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/tok/rpc")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id":1,"method":"reboot"}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let config = SessionConfig {
            poll_interval: Duration::from_secs(60),
            ..fast()
        };
        let link = link(&server, config);
        let interrupt = Interrupt::new();

        let poller = {
            let interrupt = interrupt.clone();
            tokio::spawn(async move {
                let mut calls = 0;
                link.long_poll(Endpoint::Rpc, Duration::from_millis(50), &interrupt, |_| {
                    calls += 1
                })
                .await;
                calls
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        interrupt.trigger();

        // the wait between calls is cut short
        let calls = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("poll loop should stop")
            .unwrap();
        assert_eq!(calls, 1);
        mock.assert_async().await;
    }
}
