//! RPC-over-queue: request/reply on top of the fire-and-forget bus.
//!
//! A caller derives a reply-queue name from its own identity, declares and
//! binds that queue on the reply exchange, starts a consumer on it *before*
//! publishing the request (a fast reply must not be missed), then reads
//! replies through a single-capacity handoff until the close sentinel.
//!
//! Every read carries a deadline, and the reply queue is torn down when the
//! stream is dropped, on every exit path. A reply consumer that outlives
//! its caller would otherwise leak.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::api::events::CommandTag;
use crate::api::subject::Subject;
use crate::commons::bus::{
    Delivery, Disposition, Message, MessageBus, QueueOptions,
};
use crate::commons::error::Error;
use crate::commons::WardResult;
use crate::constants::REPLY_EXCHANGE;

//------------ RpcClient -----------------------------------------------------

/// The caller side of the RPC-over-queue pattern.
#[derive(Clone, Debug)]
pub struct RpcClient {
    bus: Arc<MessageBus>,
    deadline: Duration,
}

impl RpcClient {
    pub fn new(bus: Arc<MessageBus>, deadline: Duration) -> Self {
        RpcClient { bus, deadline }
    }

    /// The reply-queue name for a caller identity. Deterministic, so a
    /// caller always reuses its own queue name and two distinct callers
    /// never collide.
    pub fn reply_queue_name(identity: &str) -> String {
        format!("reply-{identity}")
    }

    /// Sends a request expecting a stream of subjects.
    ///
    /// Returns once the reply consumer is registered and the request is
    /// published. The stream ends when the responder's close sentinel
    /// arrives.
    pub async fn request_stream<T: Serialize>(
        &self,
        target_queue: &str,
        tag: CommandTag,
        body: &T,
        identity: &str,
    ) -> WardResult<ReplyStream> {
        let queue = Self::reply_queue_name(identity);

        self.bus.declare_queue(&queue, QueueOptions::default())?;
        self.bus.bind_queue(&queue, REPLY_EXCHANGE, &queue)?;

        // Single-capacity handoff: the consumer blocks until the calling
        // workflow has taken the previous reply.
        let (tx, rx) = mpsc::channel(1);

        // Consumer first, publish second.
        self.bus.consume(&queue, move |delivery: Delivery| {
            let tx = tx.clone();
            async move { handle_reply(delivery, tx).await }
        })?;

        let stream = ReplyStream {
            bus: self.bus.clone(),
            queue: queue.clone(),
            rx,
            deadline: self.deadline,
        };

        let message = Message::json(body)?
            .with_kind(tag)
            .with_reply_to(queue.clone())
            .with_correlation_id(identity);

        // The stream guard tears the queue down if the publish fails.
        self.bus.publish("", target_queue, message)?;

        Ok(stream)
    }

    /// Sends a request expecting at most one subject.
    ///
    /// `None` is the defined not-found result, distinct from transport
    /// errors.
    pub async fn request_one<T: Serialize>(
        &self,
        target_queue: &str,
        tag: CommandTag,
        body: &T,
        identity: &str,
    ) -> WardResult<Option<Subject>> {
        let mut stream =
            self.request_stream(target_queue, tag, body, identity).await?;
        let first = stream.recv().await?;
        if first.is_some() {
            // Drain the sentinel so the consumer stops cleanly before
            // the queue is deleted.
            while stream.recv().await?.is_some() {}
        }
        Ok(first)
    }
}

async fn handle_reply(
    delivery: Delivery,
    tx: mpsc::Sender<Reply>,
) -> Disposition {
    let subject: Subject = match delivery.message.parse() {
        Ok(subject) => subject,
        Err(e) => {
            debug!("ignoring unparseable reply: {e}");
            return Disposition::Drop;
        }
    };

    let closing = delivery.message.kind == Some(CommandTag::CloseStream);

    if !subject.is_empty() {
        // A dropped receiver means the caller gave up; stop consuming so
        // the queue can be deleted.
        if tx.send(Reply::Item(subject)).await.is_err() {
            return Disposition::Stop;
        }
    }

    if closing {
        let _ = tx.send(Reply::End).await;
        Disposition::Stop
    } else {
        Disposition::Ack
    }
}

enum Reply {
    Item(Subject),
    End,
}

//------------ ReplyStream ---------------------------------------------------

/// The caller's view of an in-flight reply stream.
///
/// Dropping the stream deletes the reply queue, which in turn stops the
/// reply consumer. This holds on every exit path, including deadline hits
/// and callers that abandon the stream halfway.
pub struct ReplyStream {
    bus: Arc<MessageBus>,
    queue: String,
    rx: mpsc::Receiver<Reply>,
    deadline: Duration,
}

impl ReplyStream {
    /// The next subject, or `None` once the close sentinel was seen.
    pub async fn recv(&mut self) -> WardResult<Option<Subject>> {
        match timeout(self.deadline, self.rx.recv()).await {
            Err(_) => Err(Error::RpcTimeout(self.queue.clone())),
            Ok(None) => Err(Error::RpcClosed(self.queue.clone())),
            Ok(Some(Reply::End)) => Ok(None),
            Ok(Some(Reply::Item(subject))) => Ok(Some(subject)),
        }
    }

    /// Reads the stream to its end.
    pub async fn collect(mut self) -> WardResult<Vec<Subject>> {
        let mut subjects = Vec::new();
        while let Some(subject) = self.recv().await? {
            subjects.push(subject);
        }
        Ok(subjects)
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.bus.delete_queue(&self.queue);
    }
}

//============ Tests =========================================================
