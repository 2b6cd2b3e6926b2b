use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use kube::core::DynamicObject;
use lariat_cache::{Informer, keys};
use tokio_util::sync::CancellationToken;

use crate::workqueue::{RateLimiter, WorkQueue, default_rate_limiter};
use crate::{Error, Result};

const EVENT_BUFFER: usize = 256;

/// The function a controller invokes for every dispatched key. The object is
/// `None` when the key is no longer present in the informer's store.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_change(&self, key: &str, obj: Option<DynamicObject>) -> Result<()>;
}

/// Binds one informer to one work queue and N workers invoking a handler.
///
/// Construction subscribes to the informer, so no event enqueued afterwards
/// is lost; keys arriving before [`Controller::run`] are buffered and
/// flushed into the queue on start.
pub struct Controller {
    name: String,
    informer: Arc<Informer>,
    handler: Arc<dyn Handler>,
    rate_limiter: Arc<dyn RateLimiter>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queue: Option<Arc<WorkQueue>>,
    start_keys: Vec<(String, Duration)>,
    started: bool,
}

impl Controller {
    pub fn new(
        name: impl ToString,
        informer: Arc<Informer>,
        handler: Arc<dyn Handler>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            name: name.to_string(),
            informer: informer.clone(),
            handler,
            rate_limiter: rate_limiter.unwrap_or_else(default_rate_limiter),
            state: Mutex::new(State::default()),
        });

        // informer events feed the queue for the controller's whole lifetime
        let mut events = informer.subscribe(EVENT_BUFFER);
        let weak: Weak<Controller> = Arc::downgrade(&controller);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match weak.upgrade() {
                    Some(controller) => controller.enqueue_key(event.key()),
                    None => return,
                }
            }
        });

        controller
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn informer(&self) -> &Arc<Informer> {
        &self.informer
    }

    pub fn enqueue(&self, namespace: Option<&str>, name: &str) {
        self.enqueue_key(keys::join(namespace, name));
    }

    pub fn enqueue_after(&self, namespace: Option<&str>, name: &str, delay: Duration) {
        let key = keys::join(namespace, name);
        let mut state = self.state.lock().unwrap();
        match &state.queue {
            Some(queue) => queue.add_after(&key, delay),
            None => state.start_keys.push((key, delay)),
        }
    }

    pub fn enqueue_key(&self, key: impl ToString) {
        let key = key.to_string();
        let mut state = self.state.lock().unwrap();
        match &state.queue {
            Some(queue) => queue.add(&key),
            None => state.start_keys.push((key, Duration::ZERO)),
        }
    }

    /// Starts the controller: starts the informer if needed and spawns
    /// `workers` worker loops once the cache has synced. Workers drain the
    /// queue and stop when `cancel` fires. Calling `run` again on a running
    /// controller is a no-op.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(Error::NoWorkers(self.name.clone()));
        }
        let queue = {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return Ok(());
            }
            state.started = true;
            let queue = WorkQueue::with_rate_limiter(&self.name, self.rate_limiter.clone());
            for (key, delay) in state.start_keys.drain(..) {
                queue.add_after(&key, delay);
            }
            state.queue = Some(queue.clone());
            queue
        };

        self.informer.spawn(cancel.clone());

        // drain the queue once the run context ends
        {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                queue.shut_down();
            });
        }

        let controller = self.clone();
        tokio::spawn(async move {
            if !controller.informer.wait_for_sync(&cancel).await {
                tracing::warn!(controller = %controller.name, "cache never synced; no workers started");
                queue.shut_down();
                return;
            }
            tracing::debug!(controller = %controller.name, workers, "starting workers");
            for _ in 0..workers {
                let controller = controller.clone();
                let queue = queue.clone();
                tokio::spawn(async move { controller.run_worker(queue).await });
            }
        });
        Ok(())
    }

    async fn run_worker(&self, queue: Arc<WorkQueue>) {
        while let Some(key) = queue.get().await {
            let result = AssertUnwindSafe(self.process(&key)).catch_unwind().await;
            queue.done(&key);
            match result {
                Ok(Ok(())) => queue.forget(&key),
                Ok(Err(err)) if err.is_ignore() => queue.forget(&key),
                Ok(Err(err)) if err.is_permanent() => {
                    tracing::error!(
                        controller = %self.name,
                        key,
                        error = %err,
                        "permanent error processing key"
                    );
                    queue.forget(&key);
                }
                Ok(Err(err)) => {
                    tracing::debug!(
                        controller = %self.name,
                        key,
                        error = %err,
                        "error processing key; requeueing"
                    );
                    queue.add_rate_limited(&key);
                }
                Err(panic) => {
                    tracing::error!(
                        controller = %self.name,
                        key,
                        panic = panic_message(&panic),
                        "handler panicked; requeueing"
                    );
                    queue.add_rate_limited(&key);
                }
            }
        }
    }

    async fn process(&self, key: &str) -> Result<()> {
        let obj = self
            .informer
            .store()
            .get_by_key(key)
            .map(|obj| (*obj).clone());
        self.handler.on_change(key, obj).await
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
