//! Live Jetstream websocket source.
//!
//! Subscribes with `wantedCollections` and a `cursor`, feeds each text frame
//! to the handler in order, and reconnects with backoff whenever the
//! connection drops or the handler fails. Every reconnect resumes from the
//! handler's last finished event, so nothing received but unprocessed is lost.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use rito_core::{JetstreamEvent, TRACKED_COLLECTIONS};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{ConnectionManager, EventHandler, EventSource, ReconnectConfig, SourceStats};
use crate::{Error, Result};

pub const DEFAULT_ENDPOINTS: [&str; 2] = [
    "wss://jetstream1.us-east.bsky.network/subscribe",
    "wss://jetstream2.us-east.bsky.network/subscribe",
];

#[derive(Debug, Clone)]
pub struct JetstreamConfig {
    /// Endpoints tried in rotation; the first is primary.
    pub endpoints: Vec<String>,
    pub wanted_collections: Vec<String>,
    /// How far back to start when no cursor has been checkpointed.
    pub lookback: Option<Duration>,
    pub reconnect: ReconnectConfig,
    pub connect_timeout: Duration,
    /// Reconnect if nothing arrives for this long.
    pub idle_timeout: Duration,
    /// Frames larger than this are dropped.
    pub max_message_size: usize,
}

impl Default for JetstreamConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            wanted_collections: TRACKED_COLLECTIONS.iter().map(|s| s.to_string()).collect(),
            lookback: None,
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            max_message_size: 1024 * 1024,
        }
    }
}

/// Build the subscription URL for `endpoint`.
pub fn subscribe_url(endpoint: &str, collections: &[String], cursor: Option<i64>) -> Result<String> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("invalid Jetstream endpoint '{endpoint}': {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        for collection in collections {
            query.append_pair("wantedCollections", collection);
        }
        if let Some(cursor) = cursor {
            query.append_pair("cursor", &cursor.to_string());
        }
    }
    Ok(url.to_string())
}

/// How a single connection ended.
enum ReadEnd {
    Shutdown,
    Disconnected(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct JetstreamSource {
    config: JetstreamConfig,
}

impl JetstreamSource {
    pub fn new(config: JetstreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JetstreamConfig {
        &self.config
    }

    fn lookback_cursor(&self) -> Option<i64> {
        self.config.lookback.map(|lookback| {
            chrono::Utc::now().timestamp_micros() - lookback.as_micros() as i64
        })
    }

    async fn connect(&self, url: &str) -> Result<WsStream> {
        let connecting = tokio_tungstenite::connect_async(url);
        match tokio::time::timeout(self.config.connect_timeout, connecting).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Transport(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    /// Read frames until the connection ends. Handler errors end the
    /// connection so the event is redelivered after reconnecting.
    async fn read_loop<H: EventHandler>(
        &self,
        stream: WsStream,
        handler: &mut H,
        shutdown: &mut watch::Receiver<bool>,
        stats: &mut SourceStats,
    ) -> ReadEnd {
        let (mut write, mut read) = stream.split();

        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return ReadEnd::Shutdown;
                }
                frame = tokio::time::timeout(self.config.idle_timeout, read.next()) => frame,
            };

            let text = match frame {
                Err(_) => {
                    return ReadEnd::Disconnected(format!(
                        "no frames for {:?}",
                        self.config.idle_timeout
                    ));
                }
                Ok(None) => return ReadEnd::Disconnected("stream ended".to_string()),
                Ok(Some(Err(e))) => return ReadEnd::Disconnected(format!("read error: {e}")),
                Ok(Some(Ok(Message::Text(text)))) => text,
                Ok(Some(Ok(Message::Ping(data)))) => {
                    let _ = write.send(Message::Pong(data)).await;
                    continue;
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return ReadEnd::Disconnected(format!("server closed: {frame:?}"));
                }
                Ok(Some(Ok(Message::Binary(data)))) => {
                    // Compressed frames are never requested.
                    stats.decode_errors += 1;
                    tracing::warn!(size = data.len(), "dropping unexpected binary frame");
                    continue;
                }
                Ok(Some(Ok(_))) => continue,
            };

            let text = text.as_str();
            if text.len() > self.config.max_message_size {
                stats.decode_errors += 1;
                tracing::warn!(
                    size = text.len(),
                    max = self.config.max_message_size,
                    "dropping oversized frame"
                );
                continue;
            }

            let event = match JetstreamEvent::from_json(text) {
                Ok(event) => event,
                Err(e) => {
                    stats.decode_errors += 1;
                    counter!("jetstream_decode_errors_total").increment(1);
                    tracing::warn!("Failed to decode Jetstream frame: {}", e);
                    continue;
                }
            };

            stats.total_events += 1;
            counter!("jetstream_events_received_total").increment(1);

            match handler.handle(event).await {
                Ok(true) => {}
                Ok(false) => {
                    let _ = write.send(Message::Close(None)).await;
                    return ReadEnd::Shutdown;
                }
                Err(e) => {
                    stats.handler_errors += 1;
                    let _ = write.send(Message::Close(None)).await;
                    return ReadEnd::Disconnected(format!(
                        "{} failure while processing event: {e}",
                        e.class().as_str()
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl EventSource for JetstreamSource {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    async fn run<H: EventHandler>(
        &mut self,
        handler: &mut H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SourceStats> {
        if self.config.endpoints.is_empty() {
            return Err(Error::Config("no Jetstream endpoints configured".into()));
        }

        let mut stats = SourceStats::default();
        let mut connections = 0usize;
        let mut reconnects = 0usize;
        let mut manager =
            ConnectionManager::new(self.config.endpoints.clone(), self.config.reconnect);

        // Computed once so that reconnecting before the first event does not
        // drift the start position forward.
        let start_cursor = handler.resume_cursor().or_else(|| self.lookback_cursor());
        match start_cursor {
            Some(cursor) => tracing::info!("Starting from cursor {}", cursor),
            None => tracing::info!("No cursor stored, starting from live tail"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let cursor = handler.resume_cursor().or(start_cursor);
            let url = subscribe_url(
                manager.current_endpoint(),
                &self.config.wanted_collections,
                cursor,
            )?;

            tracing::info!(endpoint = %manager.current_endpoint(), cursor = ?cursor, "connecting to Jetstream");

            let reason = match self.connect(&url).await {
                Ok(stream) => {
                    manager.reset();
                    connections += 1;
                    gauge!("jetstream_connected").set(1.0);
                    tracing::info!(endpoint = %manager.current_endpoint(), "Jetstream connected");

                    let end = self
                        .read_loop(stream, handler, &mut shutdown, &mut stats)
                        .await;
                    gauge!("jetstream_connected").set(0.0);

                    match end {
                        ReadEnd::Shutdown => break,
                        ReadEnd::Disconnected(reason) => reason,
                    }
                }
                Err(e) => format!("connect failed: {e}"),
            };

            tracing::warn!(endpoint = %manager.current_endpoint(), "Jetstream disconnected: {}", reason);

            reconnects += 1;
            counter!("jetstream_reconnects_total").increment(1);
            let delay = manager.next_backoff();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        stats.source_metadata.connections = Some(connections);
        stats.source_metadata.reconnects = Some(reconnects);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn test_subscribe_url() {
        let collections = vec![
            "blue.rito.feed.bookmark".to_string(),
            "blue.rito.feed.like".to_string(),
        ];
        let url = subscribe_url(
            "wss://jetstream.example/subscribe",
            &collections,
            Some(1_725_911_162_329_308),
        )
        .unwrap();
        assert_eq!(
            url,
            "wss://jetstream.example/subscribe?wantedCollections=blue.rito.feed.bookmark&wantedCollections=blue.rito.feed.like&cursor=1725911162329308"
        );

        let url = subscribe_url("wss://jetstream.example/subscribe", &collections, None).unwrap();
        assert!(!url.contains("cursor"));
    }

    #[test]
    fn test_subscribe_url_rejects_garbage() {
        assert!(subscribe_url("not a url", &[], None).is_err());
    }

    #[test]
    fn test_default_config_tracks_all_collections() {
        let config = JetstreamConfig::default();
        assert_eq!(config.wanted_collections.len(), TRACKED_COLLECTIONS.len());
        assert!(!config.endpoints.is_empty());
    }

    #[test]
    fn test_lookback_cursor() {
        let source = JetstreamSource::new(JetstreamConfig {
            lookback: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let cursor = source.lookback_cursor().unwrap();
        let now = chrono::Utc::now().timestamp_micros();
        assert!(now - cursor >= 60_000_000);
        assert!(now - cursor < 70_000_000);

        assert!(JetstreamSource::new(JetstreamConfig::default()).lookback_cursor().is_none());
    }

    // =========================================================================
    // Connection lifecycle against a local server
    // =========================================================================

    fn envelope(time_us: i64) -> Message {
        Message::Text(
            format!(
                r#"{{"did":"did:plc:abc","time_us":{time_us},"kind":"commit","commit":{{"rev":"r","operation":"create","collection":"blue.rito.feed.like","rkey":"l{time_us}","record":{{"subject":"https://example.com/","createdAt":"2025-03-01T00:00:00Z"}}}}}}"#
            )
            .into(),
        )
    }

    /// What the server does with one accepted connection.
    enum Script {
        /// Send the frames, then read until the client hangs up.
        SendAndHold(Vec<i64>),
        /// Send the frames, then drop the socket without a close frame.
        SendAndDrop(Vec<i64>),
    }

    /// Accept one connection per script, recording each subscription cursor.
    async fn serve(
        listener: TcpListener,
        scripts: Vec<Script>,
        cursors: Arc<Mutex<Vec<Option<i64>>>>,
    ) {
        for script in scripts {
            let (tcp, _) = listener.accept().await.unwrap();
            let seen = Arc::clone(&cursors);
            let callback = move |req: &Request,
                                 resp: Response|
                  -> std::result::Result<Response, ErrorResponse> {
                let cursor = req.uri().query().and_then(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .find(|(k, _)| k == "cursor")
                        .and_then(|(_, v)| v.parse().ok())
                });
                seen.lock().push(cursor);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();

            match script {
                Script::SendAndHold(times) => {
                    for t in times {
                        ws.send(envelope(t)).await.unwrap();
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                }
                Script::SendAndDrop(times) => {
                    for t in times {
                        ws.send(envelope(t)).await.unwrap();
                    }
                    drop(ws);
                }
            }
        }
    }

    /// Fails once on `fail_once` and flips shutdown while handling
    /// `shutdown_at`.
    struct ScriptedHandler {
        seen: Vec<i64>,
        committed: Option<i64>,
        fail_once: Option<i64>,
        shutdown_at: i64,
        shutdown: watch::Sender<bool>,
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&mut self, event: JetstreamEvent) -> Result<bool> {
            self.seen.push(event.time_us);
            if self.fail_once == Some(event.time_us) {
                self.fail_once = None;
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            if event.time_us == self.shutdown_at {
                let _ = self.shutdown.send(true);
                tokio::task::yield_now().await;
            }
            self.committed = Some(event.time_us);
            Ok(true)
        }

        fn resume_cursor(&self) -> Option<i64> {
            self.committed
        }
    }

    #[tokio::test]
    async fn test_reconnects_from_last_finished_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/subscribe", listener.local_addr().unwrap());
        let cursors = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(serve(
            listener,
            vec![
                // The handler fails on 30 after receiving it.
                Script::SendAndHold(vec![10, 20, 30]),
                // Connection lost right after 30 is delivered again.
                Script::SendAndDrop(vec![30]),
                // Shutdown is requested while 40 is being handled.
                Script::SendAndHold(vec![40]),
            ],
            Arc::clone(&cursors),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handler = ScriptedHandler {
            seen: Vec::new(),
            committed: None,
            fail_once: Some(30),
            shutdown_at: 40,
            shutdown: shutdown_tx,
        };
        let mut source = JetstreamSource::new(JetstreamConfig {
            endpoints: vec![endpoint],
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
                jitter: false,
            },
            ..Default::default()
        });

        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            source.run(&mut handler, shutdown_rx),
        )
        .await
        .unwrap()
        .unwrap();

        // Resume positions follow finished events, not received ones.
        assert_eq!(*cursors.lock(), vec![None, Some(20), Some(30)]);
        assert_eq!(handler.seen, vec![10, 20, 30, 30, 40]);
        // The in-flight event finished before run returned.
        assert_eq!(handler.committed, Some(40));
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.source_metadata.connections, Some(3));
        assert_eq!(stats.source_metadata.reconnects, Some(2));

        server.await.unwrap();
    }
}
