//! The two data-source variants: a streaming [`SseSource`] and a polling
//! [`PollingSource`], both producing the same [`Message`] shape so
//! [`crate::consumer::Consumer`] doesn't need to know which one it's
//! reading from.

use crate::message::{Message, MessageParseError};
use crate::models::AllData;
use eventsource_client::{Client as SseClient, Event, EventStream, HttpsConnector as SseHttpsConnector};
use futures::{ready, Stream};
use hyper::client::HttpConnector;
use hyper::{Body, Client as HttpClient, Method, Request};
use hyper_rustls::HttpsConnector;
use pin_project::pin_project;
use std::convert::TryInto;
use std::fmt::{Debug, Display};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Allows reading a stream of update [`Message`]s.
///
/// Whenever the stream yields an error, the consumer calls `stream()` again
/// to get a fresh one rather than treating the source as permanently dead.
pub trait Source {
    type Error;
    type Stream: Stream<Item = Result<Message, Self::Error>>;

    fn stream(&self) -> Self::Stream;
}

impl<T: Source> Source for Arc<T> {
    type Error = T::Error;
    type Stream = T::Stream;
    fn stream(&self) -> Self::Stream {
        self.as_ref().stream()
    }
}

/// Reads updates from LaunchDarkly's streaming (SSE) endpoint — the default
/// data source.
pub struct SseSource {
    client: SseClient<SseHttpsConnector>,
}

impl SseSource {
    /// `stream_uri` is the configured base (e.g. `https://stream.launchdarkly.com`,
    /// [`crate::config::Config::stream_uri`]); `/all` is appended per the
    /// wire protocol.
    pub fn new(stream_uri: &str, token: impl AsRef<str>) -> Self {
        let url = format!("{}/all", stream_uri.trim_end_matches('/'));
        let client = eventsource_client::Client::for_url(&url)
            .expect("stream URI must be a valid URL")
            .header("Authorization", token.as_ref())
            .expect("credential must be a valid header value")
            .build();
        Self { client }
    }
}

impl Source for SseSource {
    type Error = StreamError<eventsource_client::Error>;
    type Stream = MessageStream<Pin<Box<EventStream<SseHttpsConnector>>>>;

    fn stream(&self) -> Self::Stream {
        MessageStream(Box::pin(self.client.stream()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError<E>
where
    E: Debug + Display,
{
    #[error("failed to read SSE stream: {0}")]
    Inner(E),

    #[error("failed to parse event: {0}")]
    Parse(#[from] MessageParseError),
}

/// Adapts a stream of raw SSE [`Event`]s into a stream of [`Message`]s.
#[pin_project]
pub struct MessageStream<S>(#[pin] S);

impl<S, E> Stream for MessageStream<S>
where
    S: Stream<Item = Result<Event, E>>,
    E: Debug + Display,
{
    type Item = Result<Message, StreamError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let event = match ready!(this.0.poll_next(cx))
            .transpose()
            .map_err(StreamError::Inner)?
        {
            Some(ev) => ev,
            None => return Poll::Ready(None),
        };
        let message = event.try_into()?;
        Poll::Ready(Some(Ok(message)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("request build failed: {0}")]
    Request(#[from] http::Error),

    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("polling endpoint returned status {0}")]
    Status(u16),

    #[error("failed to parse poll response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reads the full flag/segment set from the non-streaming `latest-all`
/// endpoint at most once per `poll_interval`. Used when
/// [`crate::config::Config::stream`] is `false`.
pub struct PollingSource {
    client: HttpClient<HttpsConnector<HttpConnector>>,
    uri: String,
    token: String,
    poll_interval: Duration,
}

impl PollingSource {
    pub fn new(base_uri: &str, token: impl Into<String>, poll_interval: Duration) -> Self {
        let https = HttpsConnector::with_native_roots();
        let client = HttpClient::builder().build(https);
        Self {
            client,
            uri: format!("{}/sdk/latest-all", base_uri.trim_end_matches('/')),
            token: token.into(),
            poll_interval,
        }
    }

    async fn poll_once(
        client: HttpClient<HttpsConnector<HttpConnector>>,
        uri: String,
        token: String,
    ) -> Result<Message, PollError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Authorization", token)
            .body(Body::empty())?;
        let response = client.request(request).await?;
        if !response.status().is_success() {
            return Err(PollError::Status(response.status().as_u16()));
        }
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        let data: AllData = serde_json::from_slice(&bytes)?;
        Ok(Message::Put(data))
    }
}

impl Source for PollingSource {
    type Error = PollError;
    type Stream = Pin<Box<dyn Stream<Item = Result<Message, PollError>> + Send>>;

    fn stream(&self) -> Self::Stream {
        let client = self.client.clone();
        let uri = self.uri.clone();
        let token = self.token.clone();
        let interval = self.poll_interval;

        Box::pin(futures::stream::unfold(
            (client, uri, token, interval, true),
            |(client, uri, token, interval, first)| async move {
                if !first {
                    tokio::time::sleep(interval).await;
                }
                let result = Self::poll_once(client.clone(), uri.clone(), token.clone()).await;
                Some((result, (client, uri, token, interval, false)))
            },
        ))
    }
}
