pub use client::{Client, ClientError, Method, Response, StatusCode};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;

    use thiserror::Error;

    #[derive(Debug, Error)]
    pub struct InvalidUriError(String);

    impl Display for InvalidUriError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    /// An absolute URI pointing at a platform endpoint
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        /// Build the plain-http base URI for a `host` and `port` pair
        pub fn from_host(host: &str, port: u16) -> Result<Self, InvalidUriError> {
            if host.is_empty() {
                return Err(InvalidUriError("host cannot be empty".to_owned()));
            }
            Ok(Self(http::Uri::from_maybe_shared(format!(
                "http://{host}:{port}"
            ))?))
        }

        /// Replace the path (and query) of `base_uri` with `segments`.
        ///
        /// Segments are percent-encoded, a `/` inside a segment does not
        /// split it.
        pub fn from_segments(
            base_uri: &Uri,
            segments: &[&str],
            query: Option<&str>,
        ) -> Result<Self, InvalidUriError> {
            let mut url = reqwest::Url::parse(&base_uri.to_string())
                .map_err(|e| InvalidUriError(e.to_string()))?;
            url.path_segments_mut()
                .map_err(|_| InvalidUriError("base URI cannot have a path".to_owned()))?
                .clear()
                .extend(segments);
            url.set_query(query);

            Ok(Self(http::Uri::from_maybe_shared(String::from(url))?))
        }

        pub fn path(&self) -> &str {
            self.0.path()
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }
}

mod client {
    use std::time::Duration;

    use reqwest::RequestBuilder;

    use super::uri::Uri;

    pub type Method = reqwest::Method;
    pub type StatusCode = reqwest::StatusCode;

    #[derive(Debug, thiserror::Error)]
    pub enum ClientError {
        #[error("failed to build client: {0}")]
        Build(reqwest::Error),

        #[error("server replied with status: {0}")]
        Response(StatusCode),

        #[error(transparent)]
        Client(reqwest::Error),

        #[error(transparent)]
        Server(reqwest::Error),
    }

    #[derive(Debug)]
    pub struct Response(reqwest::Response);

    impl Response {
        pub fn status(&self) -> StatusCode {
            self.0.status()
        }

        /// Read the full body as text, consuming the response
        pub async fn text(self) -> Result<String, ClientError> {
            self.0.text().await.map_err(ClientError::Server)
        }

        /// Fail with [ClientError::Response] unless the status is 2xx
        pub fn error_for_status(self) -> Result<Self, ClientError> {
            match self.status() {
                status if status.is_success() => Ok(self),
                status => Err(ClientError::Response(status)),
            }
        }
    }

    // Based on: https://github.com/ramsayleung/rspotify/blob/master/rspotify-http/src/reqwest.rs
    #[derive(Debug, Clone)]
    pub struct Client {
        client: reqwest::Client,
        timeout: Option<Duration>,
    }

    impl Client {
        /// Create a client applying `timeout` to every request.
        ///
        /// Fails if the underlying connection pool (TLS backend, resolver)
        /// cannot be initialized.
        pub fn try_new(timeout: Option<Duration>) -> Result<Self, ClientError> {
            let client = reqwest::Client::builder()
                .build()
                .map_err(ClientError::Build)?;
            Ok(Self { client, timeout })
        }

        /// POST a raw JSON document
        ///
        /// The payload is sent as-is, no validation is performed.
        pub async fn post_json(&self, uri: &Uri, payload: String) -> Result<Response, ClientError> {
            self.request(Method::POST, uri, |req| {
                Ok(req
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload))
            })
            .await
        }

        /// Thin wrapper around [reqwest::Request], this is your gateway to
        /// a fully customizable client if this type's methods won't do.
        pub async fn request<D>(
            &self,
            method: Method,
            uri: &Uri,
            decorator: D,
        ) -> Result<Response, ClientError>
        where
            D: FnOnce(RequestBuilder) -> Result<RequestBuilder, ClientError>,
        {
            let mut request = self.client.request(method, uri.to_string());

            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            request = decorator(request)?;

            Ok(Response(request.send().await.map_err(ClientError::Client)?))
        }
    }
}
