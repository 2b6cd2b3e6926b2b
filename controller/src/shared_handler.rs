use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use kube::core::DynamicObject;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::controller::Handler;
use crate::{Error, Result};

/// A handler registered on a shared controller. It may return a replacement
/// object, which becomes the input of the next handler in the chain for the
/// same dispatch.
#[async_trait]
pub trait SharedControllerHandler: Send + Sync {
    async fn on_change(
        &self,
        key: &str,
        obj: Option<DynamicObject>,
    ) -> Result<Option<DynamicObject>>;
}

/// Wraps an async closure as a [`SharedControllerHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn SharedControllerHandler>
where
    F: Fn(String, Option<DynamicObject>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<DynamicObject>>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> SharedControllerHandler for FnHandler<F>
where
    F: Fn(String, Option<DynamicObject>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<DynamicObject>>> + Send + 'static,
{
    async fn on_change(
        &self,
        key: &str,
        obj: Option<DynamicObject>,
    ) -> Result<Option<DynamicObject>> {
        (self.f)(key.to_string(), obj).await
    }
}

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    name: String,
    handler: Arc<dyn SharedControllerHandler>,
}

/// Ordered, name-tagged list of handlers sharing one controller's queue.
///
/// For each dispatched key the registered handlers run sequentially in
/// registration order; an object returned by one handler is threaded into
/// the next. The threaded object is an in-memory hint for the current
/// dispatch only: the informer's store is never updated from handler
/// results, durable changes must go through the client.
pub struct SharedHandler {
    controller_name: String,
    handlers: RwLock<Vec<HandlerEntry>>,
    seq: AtomicU64,
}

impl SharedHandler {
    pub fn new(controller_name: impl ToString) -> Self {
        Self {
            controller_name: controller_name.to_string(),
            handlers: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    /// Appends a handler to the dispatch list. The handler is removed when
    /// `cancel` fires; an in-flight invocation runs to completion.
    pub fn register(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        name: impl ToString,
        handler: Arc<dyn SharedControllerHandler>,
    ) {
        let id = self.seq.fetch_add(1, Ordering::SeqCst);
        self.handlers.write().unwrap().push(HandlerEntry {
            id,
            name: name.to_string(),
            handler,
        });
        let weak = Arc::downgrade(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(handlers) = weak.upgrade() {
                handlers.unregister(id);
            }
        });
    }

    fn unregister(&self, id: u64) {
        self.handlers.write().unwrap().retain(|entry| entry.id != id);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Handler for SharedHandler {
    async fn on_change(&self, key: &str, obj: Option<DynamicObject>) -> Result<()> {
        // Snapshot so registrations mid-flight take effect next dispatch.
        let handlers: Vec<HandlerEntry> = self.handlers.read().unwrap().clone();
        let mut current = obj;
        let mut first_err: Option<Error> = None;
        for entry in handlers {
            let start = Instant::now();
            let result = entry.handler.on_change(key, current.clone()).await;
            let has_error = matches!(&result, Err(err) if !err.is_ignore());
            lariat_metrics::inc_total_handler_executions(
                &self.controller_name,
                &entry.name,
                has_error,
            );
            lariat_metrics::report_reconcile_time(
                &self.controller_name,
                &entry.name,
                has_error,
                start.elapsed(),
            );
            match result {
                Ok(Some(next)) => current = Some(next),
                Ok(None) => {}
                Err(err) => {
                    if has_error {
                        tracing::error!(
                            controller = %self.controller_name,
                            handler = %entry.name,
                            key,
                            error = %err,
                            "handler failed"
                        );
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str) -> DynamicObject {
        let mut obj = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::Value::Null,
        };
        obj.metadata.name = Some(name.to_string());
        obj
    }

    fn annotate(mut obj: DynamicObject, key: &str, value: &str) -> DynamicObject {
        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        obj
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_and_thread_objects() {
        let cancel = CancellationToken::new();
        let handler = Arc::new(SharedHandler::new("test"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        handler.register(
            &cancel,
            "a",
            handler_fn(move |_key, obj| {
                let obj = annotate(obj.unwrap(), "k", "1");
                async move { Ok(Some(obj)) }
            }),
        );
        let seen = tx.clone();
        handler.register(
            &cancel,
            "b",
            handler_fn(move |_key, obj| {
                seen.send(obj).unwrap();
                async move { Ok(None) }
            }),
        );

        Handler::on_change(handler.as_ref(), "ns/x", Some(obj("x")))
            .await
            .unwrap();
        let threaded = rx.recv().await.unwrap().unwrap();
        assert_eq!(
            threaded.metadata.annotations.unwrap().get("k").map(String::as_str),
            Some("1")
        );
        drop(tx);
    }

    #[tokio::test]
    async fn nil_return_leaves_the_original_object() {
        let cancel = CancellationToken::new();
        let handler = Arc::new(SharedHandler::new("test"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        handler.register(&cancel, "a", handler_fn(|_, _| async { Ok(None) }));
        let seen = tx.clone();
        handler.register(
            &cancel,
            "b",
            handler_fn(move |_key, obj| {
                seen.send(obj).unwrap();
                async move { Ok(None) }
            }),
        );

        Handler::on_change(handler.as_ref(), "ns/x", Some(obj("x")))
            .await
            .unwrap();
        let observed = rx.recv().await.unwrap().unwrap();
        assert!(observed.metadata.annotations.is_none());
    }

    #[tokio::test]
    async fn first_error_wins_and_ignore_is_not_an_error() {
        let cancel = CancellationToken::new();
        let handler = Arc::new(SharedHandler::new("test"));

        handler.register(&cancel, "a", handler_fn(|_, _| async { Err(Error::Ignore) }));
        handler.register(
            &cancel,
            "b",
            handler_fn(|_, _| async { Err(Error::msg("first")) }),
        );
        handler.register(
            &cancel,
            "c",
            handler_fn(|_, _| async { Err(Error::msg("second")) }),
        );

        let err = Handler::on_change(handler.as_ref(), "k", None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[tokio::test]
    async fn cancelled_registration_stops_receiving_events() {
        let cancel = CancellationToken::new();
        let registration = CancellationToken::new();
        let handler = Arc::new(SharedHandler::new("test"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let seen = tx.clone();
        handler.register(
            &registration,
            "doomed",
            handler_fn(move |key, _| {
                seen.send(key).unwrap();
                async move { Ok(None) }
            }),
        );
        Handler::on_change(handler.as_ref(), "one", None).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "one");

        registration.cancel();
        // wait for the removal task to run
        while !handler.is_empty() {
            tokio::task::yield_now().await;
        }

        handler.register(&cancel, "doomed", handler_fn(|_, _| async { Ok(None) }));
        Handler::on_change(handler.as_ref(), "two", None).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
