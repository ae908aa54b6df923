//! # Message Bus
//!
//! In-process publish/subscribe runtime. Every topic has one handler
//! instance running as an actor over an unbounded FIFO mailbox, so a
//! stage's state is only ever touched by its own task.
//!
//! ```text
//! publish(topic, msg) ──▶ [mailbox: topic] ──▶ actor ──▶ handler.handle(msg, ctx)
//!        ▲                                                      │
//!        └──────────────────── ctx.publisher.publish ◀──────────┘
//! ```
//!
//! A bus-wide pending counter is raised on publish and lowered once the
//! handler returns. A handler's own publishes are counted before its
//! invocation is, so the counter reaches zero only when nothing is queued
//! and nothing is running: that is what [`MessageBus::drain_until_idle`]
//! waits for.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::messages::{Envelope, Message, Topic};
use crate::error::BusError;

/// A pipeline stage bound to one topic
#[async_trait]
pub trait Handler: Send + 'static {
    /// Process one message; output goes through `ctx.publisher`
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// What a handler gets alongside each message
#[derive(Clone)]
pub struct HandlerContext {
    /// Topic this handler serves
    pub topic: Topic,
    /// Stage that published the message, `None` for the driver
    pub sender: Option<Topic>,
    pub publisher: Publisher,
    /// Run-wide cancellation, threaded into every external call
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn publish(&self, topic: Topic, message: impl Into<Message>) -> Result<(), BusError> {
        self.publisher.publish(topic, message)
    }
}

struct BusShared {
    mailboxes: RwLock<HashMap<Topic, mpsc::UnboundedSender<Envelope>>>,
    pending: AtomicUsize,
    idle: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl BusShared {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Cloneable handle for publishing onto the bus
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<BusShared>,
    sender: Option<Topic>,
}

impl Publisher {
    /// Queue `message` for `topic`. Delivery is at most once.
    pub fn publish(&self, topic: Topic, message: impl Into<Message>) -> Result<(), BusError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let message = message.into();
        let mailboxes = self.shared.mailboxes.read().map_err(|_| BusError::Closed)?;
        let mailbox = mailboxes.get(&topic).ok_or(BusError::UnknownTopic(topic))?;

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            seq: self.shared.seq.fetch_add(1, Ordering::SeqCst),
            sender: self.sender,
            message,
        };
        tracing::debug!(topic = %topic, kind = envelope.message.kind(), seq = envelope.seq, "Publish");

        if mailbox.send(envelope).is_err() {
            self.shared.finish_one();
            return Err(BusError::Closed);
        }
        Ok(())
    }

    fn as_stage(&self, topic: Topic) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sender: Some(topic),
        }
    }
}

type HandlerFactory = Box<dyn FnOnce() -> Box<dyn Handler> + Send>;

struct Unstarted {
    factory: HandlerFactory,
    mailbox: mpsc::UnboundedReceiver<Envelope>,
}

/// The runtime: registry, mailboxes and actor tasks
pub struct MessageBus {
    shared: Arc<BusShared>,
    unstarted: HashMap<Topic, Unstarted>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    cancel: CancellationToken,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Bus whose handlers all observe `cancel`
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            shared: Arc::new(BusShared {
                mailboxes: RwLock::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            unstarted: HashMap::new(),
            tasks: Vec::new(),
            started: false,
            cancel,
        }
    }

    /// Bind `topic` to the handler `factory` builds.
    ///
    /// The mailbox exists from this point on, so publishing before
    /// [`start`](Self::start) queues messages.
    pub fn register<F, H>(&mut self, topic: Topic, factory: F) -> Result<(), BusError>
    where
        F: FnOnce() -> H + Send + 'static,
        H: Handler,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut mailboxes = self.shared.mailboxes.write().map_err(|_| BusError::Closed)?;
            if mailboxes.contains_key(&topic) {
                return Err(BusError::AlreadyRegistered(topic));
            }
            mailboxes.insert(topic, tx);
        }

        let factory: HandlerFactory = Box::new(move || Box::new(factory()) as Box<dyn Handler>);
        self.unstarted.insert(
            topic,
            Unstarted {
                factory,
                mailbox: rx,
            },
        );

        if self.started {
            self.spawn_pending();
        }
        Ok(())
    }

    /// Spawn one actor per registered topic
    pub fn start(&mut self) {
        self.started = true;
        self.spawn_pending();
    }

    fn spawn_pending(&mut self) {
        let unstarted: Vec<(Topic, Unstarted)> = self.unstarted.drain().collect();
        for (topic, Unstarted { factory, mailbox }) in unstarted {
            let handler = factory();
            let publisher = self.publisher().as_stage(topic);
            let task = tokio::spawn(run_actor(
                topic,
                handler,
                mailbox,
                publisher,
                self.cancel.clone(),
                Arc::clone(&self.shared),
            ));
            tracing::debug!(topic = %topic, "Handler started");
            self.tasks.push(task);
        }
    }

    /// Publisher for code outside any stage (the driver)
    pub fn publisher(&self) -> Publisher {
        Publisher {
            shared: Arc::clone(&self.shared),
            sender: None,
        }
    }

    pub fn publish(&self, topic: Topic, message: impl Into<Message>) -> Result<(), BusError> {
        self.publisher().publish(topic, message)
    }

    /// Messages published but not yet fully handled
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no handler is running and no message is queued.
    ///
    /// Never resolves while messages sit in mailboxes of a bus that was
    /// not started.
    pub async fn drain_until_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close every mailbox and wait for the actors to finish what they hold
    pub async fn shutdown(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Ok(mut mailboxes) = self.shared.mailboxes.write() {
            mailboxes.clear();
        }
        self.unstarted.clear();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Handler task ended abnormally");
            }
        }
    }
}

async fn run_actor(
    topic: Topic,
    mut handler: Box<dyn Handler>,
    mut mailbox: mpsc::UnboundedReceiver<Envelope>,
    publisher: Publisher,
    cancel: CancellationToken,
    shared: Arc<BusShared>,
) {
    while let Some(envelope) = mailbox.recv().await {
        let kind = envelope.message.kind();
        let ctx = HandlerContext {
            topic,
            sender: envelope.sender,
            publisher: publisher.clone(),
            cancel: cancel.clone(),
        };

        let outcome = AssertUnwindSafe(handler.handle(envelope.message, &ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(topic = %topic, kind, seq = envelope.seq, error = %format!("{:#}", e), "Handler failed");
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(topic = %topic, kind, seq = envelope.seq, panic = %reason, "Handler panicked");
            }
        }

        shared.finish_one();
    }
    tracing::debug!(topic = %topic, "Mailbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::messages::{ItemRequest, RunPlan};
    use std::sync::Mutex;
    use std::time::Duration;

    fn request(keyword: &str) -> ItemRequest {
        ItemRequest {
            keyword: keyword.into(),
            max_count: 1,
        }
    }

    /// Records every keyword it sees
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&mut self, message: Message, _ctx: &HandlerContext) -> anyhow::Result<()> {
            if let Message::ItemRequest(req) = message {
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.seen.lock().unwrap().push(req.keyword);
            }
            Ok(())
        }
    }

    /// Forwards each request to the coordinator topic as a plan
    struct Relay;

    #[async_trait]
    impl Handler for Relay {
        async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> anyhow::Result<()> {
            if let Message::ItemRequest(req) = message {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.publish(
                    Topic::Coordinator,
                    RunPlan {
                        run_topic: req.keyword,
                        total: 1,
                    },
                )?;
            }
            Ok(())
        }
    }

    struct PlanRecorder {
        seen: Arc<Mutex<Vec<(String, Option<Topic>)>>>,
    }

    #[async_trait]
    impl Handler for PlanRecorder {
        async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> anyhow::Result<()> {
            if let Message::RunPlan(plan) = message {
                self.seen.lock().unwrap().push((plan.run_topic, ctx.sender));
            }
            Ok(())
        }
    }

    struct Exploder;

    #[async_trait]
    impl Handler for Exploder {
        async fn handle(&mut self, message: Message, _ctx: &HandlerContext) -> anyhow::Result<()> {
            match message {
                Message::ItemRequest(req) if req.keyword == "panic" => panic!("boom"),
                Message::ItemRequest(req) if req.keyword == "error" => anyhow::bail!("bad input"),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_queued_before_start_delivered_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new();
        let sink = Arc::clone(&seen);
        bus.register(Topic::Collector, move || Recorder { seen: sink }).unwrap();

        for k in ["a", "b", "c"] {
            bus.publish(Topic::Collector, request(k)).unwrap();
        }
        assert_eq!(bus.pending(), 3);

        bus.start();
        bus.drain_until_idle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(bus.pending(), 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_cascaded_publishes() {
        let plans = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new();
        bus.register(Topic::Collector, || Relay).unwrap();
        let sink = Arc::clone(&plans);
        bus.register(Topic::Coordinator, move || PlanRecorder { seen: sink })
            .unwrap();
        bus.start();

        bus.publish(Topic::Collector, request("x")).unwrap();
        bus.publish(Topic::Collector, request("y")).unwrap();
        bus.drain_until_idle().await;

        let plans = plans.lock().unwrap();
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|(_, sender)| *sender == Some(Topic::Collector)));
    }

    #[tokio::test]
    async fn test_registry_errors() {
        let mut bus = MessageBus::new();
        bus.register(Topic::Collector, || Relay).unwrap();
        assert_eq!(
            bus.register(Topic::Collector, || Relay).unwrap_err(),
            BusError::AlreadyRegistered(Topic::Collector)
        );
        assert_eq!(
            bus.publish(Topic::Writer, request("x")).unwrap_err(),
            BusError::UnknownTopic(Topic::Writer)
        );
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn test_handler_failures_do_not_stall_the_bus() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new();
        bus.register(Topic::Grader, || Exploder).unwrap();
        let sink = Arc::clone(&seen);
        bus.register(Topic::Collector, move || Recorder { seen: sink }).unwrap();
        bus.start();

        bus.publish(Topic::Grader, request("panic")).unwrap();
        bus.publish(Topic::Grader, request("error")).unwrap();
        bus.publish(Topic::Grader, request("fine")).unwrap();
        bus.publish(Topic::Collector, request("after")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), bus.drain_until_idle())
            .await
            .expect("bus should drain");
        assert_eq!(*seen.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_closed() {
        let mut bus = MessageBus::new();
        bus.register(Topic::Collector, || Relay).unwrap();
        bus.start();
        let publisher = bus.publisher();
        bus.shutdown().await;

        assert_eq!(
            publisher.publish(Topic::Collector, request("late")).unwrap_err(),
            BusError::Closed
        );
    }
}
