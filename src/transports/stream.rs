use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Pull iterator over a push source (SSE frames, NDJSON chunks, gRPC server
/// streams, WebSocket frames). `next` returns `Ok(None)` at end of stream;
/// `close` is idempotent and cancels any background producer. After `close`,
/// every subsequent `next` returns end of stream.
#[async_trait]
pub trait StreamResult: Send + fmt::Debug {
    async fn next(&mut self) -> Result<Option<Value>>;
    async fn close(&mut self) -> Result<()>;
}

type CloseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Stream over a pre-materialized sequence of values.
pub struct SliceStream {
    items: Vec<Value>,
    index: usize,
    closed: bool,
    close_fn: Option<CloseFn>,
}

impl SliceStream {
    pub fn new(items: Vec<Value>, close_fn: Option<CloseFn>) -> Self {
        Self {
            items,
            index: 0,
            closed: false,
            close_fn,
        }
    }
}

impl fmt::Debug for SliceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceStream")
            .field("items", &self.items)
            .field("index", &self.index)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl StreamResult for SliceStream {
    async fn next(&mut self) -> Result<Option<Value>> {
        if self.closed || self.index >= self.items.len() {
            return Ok(None);
        }
        let item = self.items[self.index].clone();
        self.index += 1;
        Ok(Some(item))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(close_fn) = self.close_fn.take() {
            close_fn()?;
        }
        Ok(())
    }
}

/// Stream over a bounded channel fed by a producer task. An `Err` received on
/// the channel surfaces as the call error; channel closure is end of stream.
/// `close` runs the supplied cancel hook, which must terminate the producer.
pub struct ChannelStream {
    rx: mpsc::Receiver<Result<Value>>,
    closed: bool,
    close_fn: Option<CloseFn>,
}

impl ChannelStream {
    pub fn new(rx: mpsc::Receiver<Result<Value>>, close_fn: Option<CloseFn>) -> Self {
        Self {
            rx,
            closed: false,
            close_fn,
        }
    }
}

impl fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStream")
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl StreamResult for ChannelStream {
    async fn next(&mut self) -> Result<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(v)) => Ok(Some(v)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Closing the receiver makes blocked producers observe a send error
        // and exit promptly even without an explicit cancel hook.
        self.rx.close();
        if let Some(close_fn) = self.close_fn.take() {
            close_fn()?;
        }
        Ok(())
    }
}

pub fn boxed_channel_stream(
    rx: mpsc::Receiver<Result<Value>>,
    close_fn: Option<CloseFn>,
) -> Box<dyn StreamResult> {
    Box::new(ChannelStream::new(rx, close_fn))
}

pub fn boxed_slice_stream(items: Vec<Value>) -> Box<dyn StreamResult> {
    Box::new(SliceStream::new(items, None))
}

/// Drain a stream to completion, closing it afterwards.
pub async fn collect(stream: &mut dyn StreamResult) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await? {
        items.push(item);
    }
    stream.close().await?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn slice_stream_yields_then_ends() {
        let mut stream = SliceStream::new(vec![json!(1), json!({"two": 2})], None);
        assert_eq!(stream.next().await.unwrap(), Some(json!(1)));
        assert_eq!(stream.next().await.unwrap(), Some(json!({"two": 2})));
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn next_after_close_is_end_of_stream() {
        let mut stream = SliceStream::new(vec![json!(1), json!(2), json!(3)], None);
        assert_eq!(stream.next().await.unwrap(), Some(json!(1)));
        stream.close().await.unwrap();
        assert_eq!(stream.next().await.unwrap(), None);

        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(json!("pending"))).await.unwrap();
        let mut stream = ChannelStream::new(rx, None);
        stream.close().await.unwrap();
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_runs_hook_once() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();
        let (_tx, rx) = mpsc::channel::<Result<Value>>(1);
        let mut stream = ChannelStream::new(
            rx,
            Some(Box::new(move || {
                assert!(!closed_clone.swap(true, Ordering::SeqCst), "hook ran twice");
                Ok(())
            })),
        );

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn channel_stream_surfaces_errors_then_ends() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(json!("ok"))).await.unwrap();
        tx.send(Err(anyhow!("boom"))).await.unwrap();
        drop(tx);

        let mut stream = ChannelStream::new(rx, None);
        assert_eq!(stream.next().await.unwrap(), Some(json!("ok")));
        let err = stream.next().await.unwrap_err();
        assert!(format!("{err}").contains("boom"));
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn closing_receiver_unblocks_producer() {
        let (tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            let mut i = 0u64;
            loop {
                i += 1;
                if tx.send(Ok(json!(i))).await.is_err() {
                    return i;
                }
            }
        });

        let mut stream = ChannelStream::new(rx, None);
        assert!(stream.next().await.unwrap().is_some());
        stream.close().await.unwrap();

        let sent = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer must exit after close")
            .unwrap();
        assert!(sent >= 1);
    }

    #[tokio::test]
    async fn collect_drains_and_closes() {
        let mut stream = SliceStream::new(vec![json!("a"), json!("b")], None);
        let items = collect(&mut stream).await.unwrap();
        assert_eq!(items, vec![json!("a"), json!("b")]);
        assert_eq!(stream.next().await.unwrap(), None);
    }
}
