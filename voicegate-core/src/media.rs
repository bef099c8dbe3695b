//! External-media socket plumbing.
//!
//! The switch opens a socket server per external-media channel; we connect
//! as a client with subprotocol `media` and exchange raw PCM as binary
//! frames. The socket is single-owner on each side: one writer task drains
//! an mpsc of outbound frames, one reader task forwards inbound frames.
//! Buffered-outbound-byte accounting rides an atomic so the playback
//! scheduler can apply watermarks without touching the sink.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::switch::MEDIA_CONNECT_DEADLINE;

/// What the playback scheduler needs from an outbound audio sink.
pub trait MediaSink: Send + Sync {
    /// Queue one frame. Returns false if the sink is closed or refuses it.
    fn send_frame(&self, frame: Vec<u8>) -> bool;

    /// Bytes queued but not yet written to the wire.
    fn buffered_bytes(&self) -> usize;

    fn is_open(&self) -> bool;
}

#[derive(Debug)]
enum WriterCmd {
    Frame(Vec<u8>),
    Close,
}

/// A connected external-media socket.
#[derive(Debug)]
pub struct MediaSocket {
    tx: mpsc::Sender<WriterCmd>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl MediaSocket {
    /// Connect to the switch's media socket for one external-media channel.
    ///
    /// Returns the socket plus the inbound frame stream. Callers that only
    /// write (playback) may drop the receiver; inbound frames are then
    /// discarded without tearing the connection down.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Validation(format!("media socket url: {e}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("media"));

        let (stream, _) = tokio::time::timeout(MEDIA_CONNECT_DEADLINE, connect_async(request))
            .await
            .map_err(|_| Error::timeout(format!("media socket connect: {url}")))?
            .map_err(|e| Error::Unavailable(format!("media socket {url}: {e}")))?;

        let (mut sink, mut source) = stream.split();
        let buffered = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));
        let (tx, mut writer_rx) = mpsc::channel::<WriterCmd>(1024);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer: sole owner of the sink. Decrements the buffered count
        // only after the write future resolves, i.e. the frame reached the
        // transport.
        let writer_open = Arc::clone(&open);
        let writer_buffered = Arc::clone(&buffered);
        tokio::spawn(async move {
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCmd::Frame(data) => {
                        let len = data.len();
                        let result = sink.send(Message::Binary(data)).await;
                        writer_buffered.fetch_sub(len, Ordering::SeqCst);
                        if let Err(e) = result {
                            debug!("media socket write failed: {e}");
                            break;
                        }
                    }
                    WriterCmd::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        // Reader: forwards binary frames until the consumer goes away, then
        // keeps draining so the connection stays healthy for the writer.
        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            let mut forward = true;
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        if forward && inbound_tx.send(data).await.is_err() {
                            forward = false;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("media socket read failed: {e}");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Ok((
            Self { tx, buffered, open },
            inbound_rx,
        ))
    }

    /// Close the socket. Queued frames ahead of the close are still written.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.tx.send(WriterCmd::Close).await;
    }
}

impl MediaSink for MediaSocket {
    fn send_frame(&self, frame: Vec<u8>) -> bool {
        if !self.is_open() {
            return false;
        }
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        match self.tx.try_send(WriterCmd::Frame(frame)) {
            Ok(()) => true,
            Err(_) => {
                self.buffered.fetch_sub(len, Ordering::SeqCst);
                false
            }
        }
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Echo-less sink server: counts received binary bytes, replies nothing.
    async fn spawn_server() -> (String, mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(data) => {
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        (format!("ws://{addr}"), rx)
    }

    #[tokio::test]
    async fn test_frames_reach_server_and_buffer_drains() {
        let (url, mut server_rx) = spawn_server().await;
        let (socket, _inbound) = MediaSocket::connect(&url).await.unwrap();

        let frame = vec![7u8; 640];
        assert!(socket.send_frame(frame.clone()));
        let received = server_rx.recv().await.unwrap();
        assert_eq!(received, frame);

        // Writer decrements once the frame is on the wire.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(socket.buffered_bytes(), 0);
        assert!(socket.is_open());
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        let (url, _server_rx) = spawn_server().await;
        let (socket, _inbound) = MediaSocket::connect(&url).await.unwrap();

        socket.close().await;
        assert!(!socket.is_open());
        assert!(!socket.send_frame(vec![0u8; 4]));
    }

    #[tokio::test]
    async fn test_inbound_frames_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3, 4])).await.unwrap();
        });

        let (_socket, mut inbound) = MediaSocket::connect(&format!("ws://{addr}")).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_unavailable() {
        let err = MediaSocket::connect("ws://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
