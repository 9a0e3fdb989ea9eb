//! Websocket transport to worker devices
//!
//! Implements the device connection seam over `tokio-tungstenite`. Each
//! connection runs one reader task that routes replies to the waiting
//! caller by kind; the borrow/release protocol in the pool guarantees at
//! most one outstanding request per kind on a handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use workty_core::prelude::{
    Device, DeviceConnector, DeviceHandle, Error, ExecutePayload, ExecutionResult, Result,
};
use workty_protocol::{DeviceReply, DeviceRequest, Platform};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Pong replies are not tied to a request id; give slow devices a grace
/// period before reporting the probe as failed
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WsConnector;

#[async_trait]
impl DeviceConnector for WsConnector {
    async fn connect(&self, device: &Device) -> Result<Arc<dyn DeviceHandle>> {
        let url = device.url();
        debug!(device_id = %device.id, url = %url, "connecting to device");

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| Error::DeviceOffline(e.to_string()))?;
        let (sender, receiver) = ws_stream.split();

        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();

        let device_id = device.id;
        let reader = tokio::spawn(async move {
            route_replies(device_id, receiver, platform_tx, completed_tx, pong_tx).await;
        });

        Ok(Arc::new(WsHandle {
            sender: Mutex::new(sender),
            platform_rx: Mutex::new(platform_rx),
            completed_rx: Mutex::new(completed_rx),
            pong_rx: Mutex::new(pong_rx),
            reader,
        }))
    }
}

/// Reader side of one device connection; ends when the socket does, which
/// closes every reply channel and unblocks waiting callers
async fn route_replies(
    device_id: uuid::Uuid,
    mut receiver: WsSource,
    platform_tx: mpsc::UnboundedSender<Platform>,
    completed_tx: mpsc::UnboundedSender<ExecutionResult>,
    pong_tx: mpsc::UnboundedSender<()>,
) {
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!(%device_id, "device closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(%device_id, error = %e, "device socket error");
                break;
            }
        };

        match serde_json::from_str::<DeviceReply>(&text) {
            Ok(DeviceReply::SendConfiguration { platform }) => {
                let _ = platform_tx.send(platform);
            }
            Ok(DeviceReply::Completed {
                instance_id,
                err,
                result,
            }) => {
                debug!(%device_id, %instance_id, "execution completed on device");
                let _ = completed_tx.send(ExecutionResult { err, data: result });
            }
            Ok(DeviceReply::Pong) => {
                let _ = pong_tx.send(());
            }
            Err(e) => {
                warn!(%device_id, error = %e, "unparseable device reply, ignoring");
            }
        }
    }
}

struct WsHandle {
    sender: Mutex<WsSink>,
    platform_rx: Mutex<mpsc::UnboundedReceiver<Platform>>,
    completed_rx: Mutex<mpsc::UnboundedReceiver<ExecutionResult>>,
    pong_rx: Mutex<mpsc::UnboundedReceiver<()>>,
    reader: JoinHandle<()>,
}

impl WsHandle {
    async fn send(&self, request: &DeviceRequest) -> Result<()> {
        let json =
            serde_json::to_string(request).map_err(|e| Error::DeviceOffline(e.to_string()))?;
        self.sender
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| Error::DeviceOffline(e.to_string()))
    }
}

#[async_trait]
impl DeviceHandle for WsHandle {
    async fn configuration(&self) -> Result<Platform> {
        self.send(&DeviceRequest::GetConfiguration).await?;
        self.platform_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::DeviceOffline("connection lost during handshake".into()))
    }

    async fn execute(&self, payload: ExecutePayload) -> Result<ExecutionResult> {
        self.send(&DeviceRequest::Execute {
            instance_id: payload.instance_id,
            workflow_id: payload.workflow_id,
            workty_id: payload.workty_id,
            code: payload.code,
            properties: payload.properties,
        })
        .await?;
        self.completed_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::DeviceOffline("connection lost during execution".into()))
    }

    async fn ping(&self) -> Result<()> {
        self.send(&DeviceRequest::Ping).await?;
        let mut pong_rx = self.pong_rx.lock().await;
        match tokio::time::timeout(PONG_TIMEOUT, pong_rx.recv()).await {
            Ok(Some(())) => Ok(()),
            Ok(None) => Err(Error::DeviceOffline("connection lost awaiting pong".into())),
            Err(_) => Err(Error::DeviceOffline("pong timed out".into())),
        }
    }

    async fn close(&self) {
        let _ = self.sender.lock().await.send(Message::Close(None)).await;
        self.reader.abort();
    }
}
