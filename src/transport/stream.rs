use super::{Serials, Transport, TransportError};
use crate::{
    message::{Message, MessageKind},
    names::SIGNAL_NAME_ACQUIRED,
};
use async_bincode::{tokio::AsyncBincodeStream, AsyncDestination};
use futures::{
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufStream},
    sync::watch,
};
use tracing::{debug, trace};

pub(crate) type Framed<S> = AsyncBincodeStream<BufStream<S>, Message, Message, AsyncDestination>;

pub(crate) fn framed<S>(io: S) -> Framed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    AsyncBincodeStream::<_, Message, Message, _>::from(BufStream::new(io)).for_async()
}

/// Length-prefixed bincode frames over any byte stream.
///
/// The bus end announces the peer's unique name with a `NameAcquired`
/// signal as its first frame; [`handshake`](Self::handshake) waits for it.
pub struct StreamTransport<S> {
    name: String,
    serials: Serials,
    outbox: Mutex<VecDeque<Message>>,
    sink: tokio::sync::Mutex<SplitSink<Framed<S>, Message>>,
    stream: tokio::sync::Mutex<SplitStream<Framed<S>>>,
    closed: watch::Sender<bool>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub async fn handshake(io: S) -> Result<Self, TransportError> {
        let (sink, mut stream) = framed(io).split();
        let hello = stream.next().await.ok_or(TransportError::Closed)??;
        let name = match (hello.kind(), hello.member(), hello.first_str()) {
            (MessageKind::Signal, Some(SIGNAL_NAME_ACQUIRED), Some(name)) => name.to_owned(),
            _ => {
                return Err(TransportError::Handshake(format!(
                    "expected {SIGNAL_NAME_ACQUIRED}, got {hello}"
                )))
            }
        };
        debug!(%name, "connected to bus");
        Ok(Self {
            name,
            serials: Serials::default(),
            outbox: Mutex::new(VecDeque::new()),
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            closed: watch::channel(false).0,
        })
    }

    async fn flush_outbox(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        loop {
            // peek, so a cancelled flush leaves the message queued
            let Some(message) = self.outbox.lock().front().cloned() else {
                break;
            };
            sink.feed(message).await?;
            self.outbox.lock().pop_front();
        }
        sink.flush().await?;
        Ok(())
    }

    async fn next_message(&self) -> Result<Message, TransportError> {
        let mut closed = self.closed.subscribe();
        let next = async {
            let mut stream = self.stream.lock().await;
            Ok::<_, TransportError>(stream.next().await.ok_or(TransportError::Closed)??)
        };
        let message = tokio::select! {
            message = next => message?,
            _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
        };
        trace!(%message, "received");
        Ok(message)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn unique_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn send(&self, message: &mut Message) -> Result<u32, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let serial = self.serials.stamp(message);
        self.outbox.lock().push_back(message.clone());
        Ok(serial)
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.flush_outbox().boxed()
    }

    fn recv(&self) -> BoxFuture<'_, Result<Message, TransportError>> {
        self.next_message().boxed()
    }

    fn close(&self) {
        self.closed.send_replace(true);
        self.outbox.lock().clear();
    }
}
