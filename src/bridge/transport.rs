use crate::config::BridgeConfig;
use crate::protocol::StreamEvent;
use crate::{RemoteClient, RemoteReceiver, RemoteSender, Result};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Write side of the remote stream. Only the session manager holds one.
pub trait FrameSink: Send {
    fn send(&mut self, event: &StreamEvent) -> BoxFuture<'_, Result<()>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Read side of the remote stream. `Ok(None)` is end of stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>>>;
}

/// Opens a remote stream and hands back its two halves.
pub trait Connector: Send + Sync {
    fn open<'a>(
        &'a self,
        config: &'a BridgeConfig,
    ) -> BoxFuture<'a, Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>>;
}

/// Connector backed by the WebSocket `RemoteClient`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open<'a>(
        &'a self,
        config: &'a BridgeConfig,
    ) -> BoxFuture<'a, Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>> {
        Box::pin(async move {
            let client = RemoteClient::connect(config).await?;
            let (sender, receiver) = client.split();
            Ok((Box::new(sender) as Box<dyn FrameSink>, Box::new(receiver) as Box<dyn FrameSource>))
        })
    }
}

impl FrameSink for RemoteSender {
    fn send(&mut self, event: &StreamEvent) -> BoxFuture<'_, Result<()>> {
        let event = event.clone();
        Box::pin(async move { Self::send(self, &event).await })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Self::close(self).await })
    }
}

impl FrameSource for RemoteReceiver {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { Self::next_frame(self).await })
    }
}
