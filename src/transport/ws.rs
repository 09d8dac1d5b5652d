use crate::error::Result;
use futures::{Sink, Stream};
use reqwest::header::HeaderValue;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

const MODEL_ID_HEADER: &str = "x-s2s-model-id";

/// WebSocket carrying the remote speech stream.
#[derive(Debug)]
pub struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl WsStream {
    pub(crate) const fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self(stream)
    }
}

impl Stream for WsStream {
    type Item = std::result::Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

impl Sink<Message> for WsStream {
    type Error = WsError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> std::result::Result<(), WsError> {
        Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        Pin::new(&mut self.0).poll_close(cx)
    }
}

/// Open the bidirectional stream to the speech service.
///
/// Credentials are resolved outside this crate; when `authorization` is set it
/// is attached verbatim as the `Authorization` header.
///
/// # Errors
/// Returns an error if a header value is invalid or the handshake fails.
pub async fn connect(endpoint: &Url, model_id: &str, authorization: Option<&str>) -> Result<WsStream> {
    let mut req = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
        endpoint.as_str(),
    )?;
    let h = req.headers_mut();
    if let Some(auth) = authorization {
        h.insert(reqwest::header::AUTHORIZATION, HeaderValue::from_str(auth)?);
    }
    h.insert(MODEL_ID_HEADER, HeaderValue::from_str(model_id)?);
    let (ws_stream, _) = connect_async(req).await?;

    tracing::info!(endpoint = %endpoint, model_id, "Connected to speech stream");

    Ok(WsStream::new(ws_stream))
}
