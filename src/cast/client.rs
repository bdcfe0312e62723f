//! CASTV2 client over TLS
//!
//! A reader task routes replies to pending requests by `requestId`, answers
//! heartbeats and forwards MEDIA_STATUS as [`CastEvent::Status`]. A writer
//! task owns the write half and sends our own PINGs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cast::frame::{read_frame, write_frame, CastFrame};
use crate::cast::media::{self, MediaInfo, RunningApp};
use crate::cast::{CastChannel, CastConnector, CastEvent};
use crate::config::{CastConfig, HttpConfig};
use crate::error::CastError;
use crate::network::local_ip_for_remote;

const OUTGOING_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

type PendingRequests = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

/// Maps stream ids to the URL a target fetches them from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUrls {
    advertise_address: Option<String>,
    port: u16,
}

impl StreamUrls {
    pub fn new(advertise_address: Option<String>, port: u16) -> Self {
        Self {
            advertise_address,
            port,
        }
    }

    pub fn from_config(http: &HttpConfig) -> Self {
        Self::new(http.advertise_address.clone(), http.port)
    }

    /// URL of `stream_id` as reachable from `peer`
    pub fn url_for(&self, stream_id: &str, peer: Option<IpAddr>) -> String {
        let host = match (&self.advertise_address, peer.and_then(local_ip_for_remote)) {
            (Some(address), _) => address.clone(),
            (None, Some(IpAddr::V6(ip))) => format!("[{}]", ip),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => "127.0.0.1".to_string(),
        };

        let base = format!("http://{}:{}/", host, self.port);
        match url::Url::parse(&base) {
            Ok(mut url) => {
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.clear().push("stream").push(stream_id);
                }
                url.to_string()
            }
            Err(_) => format!("{}stream/{}", base, stream_id),
        }
    }
}

/// Production connector: TCP + TLS to the target's cast port
pub struct TlsCastConnector {
    config: CastConfig,
    urls: StreamUrls,
}

impl TlsCastConnector {
    pub fn new(config: CastConfig, urls: StreamUrls) -> Self {
        Self { config, urls }
    }
}

#[async_trait]
impl CastConnector for TlsCastConnector {
    async fn connect(&self, address: &str, port: u16) -> Result<Box<dyn CastChannel>, CastError> {
        let timeout = self.config.connect_timeout();

        let tcp = tokio::time::timeout(timeout, TcpStream::connect((address, port)))
            .await
            .map_err(|_| CastError::Timeout(format!("connecting to {}:{}", address, port)))?
            .map_err(|e| CastError::Connect(format!("{}:{}: {}", address, port, e)))?;
        let peer = tcp.peer_addr().ok().map(|addr| addr.ip());
        let _ = tcp.set_nodelay(true);

        // Devices present self-signed certificates
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| CastError::Tls(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let stream = tokio::time::timeout(timeout, connector.connect(address, tcp))
            .await
            .map_err(|_| CastError::Timeout(format!("TLS handshake with {}", address)))?
            .map_err(|e| CastError::Tls(e.to_string()))?;

        tracing::debug!("Cast connection to {}:{} established", address, port);
        let client = CastClient::start(stream, &self.config, self.urls.clone(), peer).await?;
        Ok(Box::new(client))
    }
}

/// One CASTV2 connection
pub struct CastClient {
    sender_id: String,
    outgoing: Option<mpsc::Sender<CastFrame>>,
    pending: PendingRequests,
    next_request_id: i64,
    events: Option<mpsc::Receiver<CastEvent>>,
    request_timeout: Duration,
    urls: StreamUrls,
    peer: Option<IpAddr>,
    app: Option<RunningApp>,
    media_session_id: Option<i64>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl CastClient {
    /// Start the I/O tasks on an established stream and CONNECT to the
    /// platform receiver
    pub async fn start<S>(
        stream: S,
        config: &CastConfig,
        urls: StreamUrls,
        peer: Option<IpAddr>,
    ) -> Result<Self, CastError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let sender_id = format!("sender-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let lost = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            read_half,
            sender_id.clone(),
            pending.clone(),
            outgoing_tx.clone(),
            ConnectionLoss::new(lost.clone(), events_tx.clone()),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            sender_id.clone(),
            outgoing_rx,
            config.heartbeat_interval(),
            ConnectionLoss::new(lost, events_tx),
        ));

        let client = Self {
            sender_id,
            outgoing: Some(outgoing_tx),
            pending,
            next_request_id: 1,
            events: Some(events_rx),
            request_timeout: config.request_timeout(),
            urls,
            peer,
            app: None,
            media_session_id: None,
            reader: Some(reader),
            writer: Some(writer),
        };
        client
            .send(media::NS_CONNECTION, media::PLATFORM_RECEIVER_ID, media::connect_message())
            .await?;
        Ok(client)
    }

    pub fn media_session_id(&self) -> Option<i64> {
        self.media_session_id
    }

    async fn send(&self, namespace: &str, destination: &str, payload: Value) -> Result<(), CastError> {
        let outgoing = self.outgoing.as_ref().ok_or(CastError::Closed)?;
        let frame = CastFrame::new(&self.sender_id, destination, namespace, payload.to_string());
        outgoing.send(frame).await.map_err(|_| CastError::Closed)
    }

    /// Send a request and wait for the reply carrying its `requestId`
    async fn request(
        &mut self,
        namespace: &str,
        destination: &str,
        build: impl FnOnce(i64) -> Value,
    ) -> Result<Value, CastError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);
        if let Err(e) = self.send(namespace, destination, build(request_id)).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CastError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(CastError::Timeout(format!("request {} on {}", request_id, namespace)))
            }
        }
    }

    async fn send_load(&mut self, media_info: &MediaInfo) -> Result<(), CastError> {
        let transport_id = self
            .app
            .as_ref()
            .map(|app| app.transport_id.clone())
            .ok_or(CastError::NotLaunched)?;
        let content_url = self.urls.url_for(&media_info.content_id, self.peer);
        tracing::debug!("Loading {} on {}", content_url, transport_id);

        let reply = self
            .request(media::NS_MEDIA, &transport_id, |id| {
                media::load_request(id, media_info, &content_url)
            })
            .await?;

        match media::message_type(&reply) {
            Some("MEDIA_STATUS") => {
                self.media_session_id = media::parse_media_status(&reply)
                    .and_then(|status| status.media_session_id)
                    .or(self.media_session_id);
                Ok(())
            }
            Some(other) => Err(CastError::Rejected(format!(
                "{}{}",
                other,
                reply
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(|r| format!(": {}", r))
                    .unwrap_or_default()
            ))),
            None => Err(CastError::InvalidFrame("reply without type".into())),
        }
    }
}

#[async_trait]
impl CastChannel for CastClient {
    async fn launch(&mut self, app_id: &str) -> Result<(), CastError> {
        let reply = self
            .request(media::NS_RECEIVER, media::PLATFORM_RECEIVER_ID, |id| {
                media::launch_request(id, app_id)
            })
            .await?;

        let app = match media::message_type(&reply) {
            Some("RECEIVER_STATUS") => media::running_app(&reply, app_id).ok_or_else(|| {
                CastError::Rejected(format!("{} not running after launch", app_id))
            })?,
            Some(other) => {
                return Err(CastError::Rejected(format!(
                    "{}: {}",
                    other,
                    reply.get("reason").and_then(Value::as_str).unwrap_or("unknown")
                )))
            }
            None => return Err(CastError::InvalidFrame("reply without type".into())),
        };

        self.send(media::NS_CONNECTION, &app.transport_id, media::connect_message())
            .await?;
        tracing::debug!("Launched {} (transport {})", app_id, app.transport_id);
        self.app = Some(app);
        Ok(())
    }

    async fn load(&mut self, media_info: &MediaInfo) -> Result<(), CastError> {
        self.send_load(media_info).await
    }

    async fn update_media(&mut self, media_info: &MediaInfo) -> Result<(), CastError> {
        if self.media_session_id.is_none() {
            return Err(CastError::NotLoaded);
        }
        self.send_load(media_info).await
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<CastEvent>> {
        self.events.take()
    }

    async fn close(&mut self) {
        if self.outgoing.is_none() {
            return;
        }
        if let Some(app) = self.app.take() {
            let _ = self
                .send(media::NS_CONNECTION, &app.transport_id, media::close_message())
                .await;
        }
        let _ = self
            .send(media::NS_CONNECTION, media::PLATFORM_RECEIVER_ID, media::close_message())
            .await;

        // Once both senders are gone the writer flushes and exits
        self.outgoing = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                tracing::debug!("Cast writer did not finish in time");
            }
        }
        self.pending.lock().clear();
        self.media_session_id = None;
    }
}

impl Drop for CastClient {
    fn drop(&mut self) {
        for task in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Reports the loss of a connection at most once
#[derive(Clone)]
struct ConnectionLoss {
    reported: Arc<AtomicBool>,
    events: mpsc::Sender<CastEvent>,
}

impl ConnectionLoss {
    fn new(reported: Arc<AtomicBool>, events: mpsc::Sender<CastEvent>) -> Self {
        Self { reported, events }
    }

    async fn report(&self, reason: String) {
        if !self.reported.swap(true, Ordering::SeqCst) {
            tracing::warn!("Cast connection lost: {}", reason);
            let _ = self.events.send(CastEvent::ConnectionLost(reason)).await;
        }
    }
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    sender_id: String,
    pending: PendingRequests,
    outgoing: mpsc::Sender<CastFrame>,
    loss: ConnectionLoss,
) where
    S: AsyncRead + AsyncWrite + Send,
{
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed by device".to_string(),
            Err(e) => break e.to_string(),
        };

        let payload: Value = match serde_json::from_str(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Ignoring non-JSON payload on {}: {}", frame.namespace, e);
                continue;
            }
        };

        match (frame.namespace.as_str(), media::message_type(&payload)) {
            (media::NS_HEARTBEAT, Some("PING")) => {
                let pong = CastFrame::new(
                    &sender_id,
                    &frame.source_id,
                    media::NS_HEARTBEAT,
                    media::pong_message().to_string(),
                );
                let _ = outgoing.try_send(pong);
            }
            (media::NS_HEARTBEAT, _) => {}
            (media::NS_CONNECTION, Some("CLOSE")) => {
                break format!("{} closed the virtual connection", frame.source_id);
            }
            _ => {
                if let Some(status) = media::parse_media_status(&payload) {
                    let _ = loss.events.try_send(CastEvent::Status(status));
                }
                let waiter = media::request_id(&payload)
                    .filter(|id| *id != 0)
                    .and_then(|id| pending.lock().remove(&id));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(payload);
                }
            }
        }
    };

    // Fail outstanding requests
    pending.lock().clear();
    loss.report(reason).await;
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    sender_id: String,
    mut outgoing: mpsc::Receiver<CastFrame>,
    heartbeat: Duration,
    loss: ConnectionLoss,
) where
    S: AsyncRead + AsyncWrite + Send,
{
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ticker.tick() => CastFrame::new(
                &sender_id,
                media::PLATFORM_RECEIVER_ID,
                media::NS_HEARTBEAT,
                media::ping_message().to_string(),
            ),
        };

        if let Err(e) = write_frame(&mut writer, &frame).await {
            loss.report(e.to_string()).await;
            return;
        }
    }

    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}
