//! Prometheus metrics shared by the cache and controller crates.
//!
//! Registration is gated on the `CATTLE_PROMETHEUS_METRICS` environment
//! variable: unless it is set to `true` when the first metric is emitted,
//! every helper in this crate is a no-op and nothing is registered.

use std::sync::atomic::AtomicU64;
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Registry, Unit};

pub const PROMETHEUS_METRICS_ENV: &str = "CATTLE_PROMETHEUS_METRICS";

/// Process-wide registry. Consumers encode this into their `/metrics`
/// endpoint with `prometheus_client::encoding::text::encode`.
pub static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::default()));

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HandlerLabels {
    pub controller_name: String,
    pub handler_name: String,
    pub has_error: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CachedObjectLabels {
    pub ctx: String,
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheStoreLabels {
    pub context: String,
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheContextLabels {
    pub context: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub name: String,
}

struct Families {
    handler_executions: Family<HandlerLabels, Counter>,
    reconcile_time: Family<HandlerLabels, Histogram>,
    cached_objects: Family<CachedObjectLabels, Gauge>,
    cache_store_count: Family<CacheStoreLabels, Gauge>,
    cache_started_count: Family<CacheContextLabels, Gauge>,
    queue_depth: Family<QueueLabels, Gauge>,
    queue_adds: Family<QueueLabels, Counter>,
    queue_retries: Family<QueueLabels, Counter>,
    queue_duration: Family<QueueLabels, Histogram>,
    work_duration: Family<QueueLabels, Histogram>,
    unfinished_work: Family<QueueLabels, Gauge<f64, AtomicU64>>,
    longest_running: Family<QueueLabels, Gauge<f64, AtomicU64>>,
}

fn reconcile_histogram() -> Histogram {
    Histogram::new([0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0].into_iter())
}

fn queue_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 14))
}

fn register(registry: &mut Registry) -> Families {
    let handler_executions = Family::<HandlerLabels, Counter>::default();
    let reconcile_time =
        Family::<HandlerLabels, Histogram>::new_with_constructor(reconcile_histogram);
    let cached_objects = Family::<CachedObjectLabels, Gauge>::default();
    let cache_store_count = Family::<CacheStoreLabels, Gauge>::default();
    let cache_started_count = Family::<CacheContextLabels, Gauge>::default();
    let queue_depth = Family::<QueueLabels, Gauge>::default();
    let queue_adds = Family::<QueueLabels, Counter>::default();
    let queue_retries = Family::<QueueLabels, Counter>::default();
    let queue_duration = Family::<QueueLabels, Histogram>::new_with_constructor(queue_histogram);
    let work_duration = Family::<QueueLabels, Histogram>::new_with_constructor(queue_histogram);
    let unfinished_work = Family::<QueueLabels, Gauge<f64, AtomicU64>>::default();
    let longest_running = Family::<QueueLabels, Gauge<f64, AtomicU64>>::default();

    registry.register(
        "lasso_controller_total_handler_execution",
        "Total count of handler executions",
        handler_executions.clone(),
    );
    registry.register_with_unit(
        "lasso_controller_reconcile_time",
        "Histogram of the durations per reconciliation per handler",
        Unit::Seconds,
        reconcile_time.clone(),
    );
    registry.register(
        "lasso_controller_total_cached_object",
        "Total count of cached objects",
        cached_objects.clone(),
    );
    registry.register(
        "cache_store_count",
        "Number of items in the cache store",
        cache_store_count.clone(),
    );
    registry.register(
        "cache_started_count",
        "Number of started caches per factory",
        cache_started_count.clone(),
    );
    registry.register(
        "workqueue_depth",
        "Current depth of the work queue",
        queue_depth.clone(),
    );
    registry.register(
        "workqueue_adds",
        "Total number of adds handled by the work queue",
        queue_adds.clone(),
    );
    registry.register(
        "workqueue_retries",
        "Total number of retries handled by the work queue",
        queue_retries.clone(),
    );
    registry.register_with_unit(
        "workqueue_queue_duration",
        "How long an item stays in the work queue before being requested",
        Unit::Seconds,
        queue_duration.clone(),
    );
    registry.register_with_unit(
        "workqueue_work_duration",
        "How long processing an item from the work queue takes",
        Unit::Seconds,
        work_duration.clone(),
    );
    registry.register_with_unit(
        "workqueue_unfinished_work",
        "How long in-flight work has been in progress, summed over workers",
        Unit::Seconds,
        unfinished_work.clone(),
    );
    registry.register_with_unit(
        "workqueue_longest_running_processor",
        "How long the longest-running worker has been processing its item",
        Unit::Seconds,
        longest_running.clone(),
    );

    Families {
        handler_executions,
        reconcile_time,
        cached_objects,
        cache_store_count,
        cache_started_count,
        queue_depth,
        queue_adds,
        queue_retries,
        queue_duration,
        work_duration,
        unfinished_work,
        longest_running,
    }
}

static FAMILIES: LazyLock<Option<Families>> = LazyLock::new(|| {
    let enabled = std::env::var(PROMETHEUS_METRICS_ENV)
        .map(|v| v == "true")
        .unwrap_or(false);
    enabled.then(|| register(&mut REGISTRY.write().unwrap()))
});

#[inline]
pub fn enabled() -> bool {
    FAMILIES.is_some()
}

pub fn inc_total_handler_executions(controller_name: &str, handler_name: &str, has_error: bool) {
    if let Some(f) = &*FAMILIES {
        f.handler_executions
            .get_or_create(&HandlerLabels {
                controller_name: controller_name.to_string(),
                handler_name: handler_name.to_string(),
                has_error,
            })
            .inc();
    }
}

pub fn report_reconcile_time(
    controller_name: &str,
    handler_name: &str,
    has_error: bool,
    elapsed: Duration,
) {
    if let Some(f) = &*FAMILIES {
        f.reconcile_time
            .get_or_create(&HandlerLabels {
                controller_name: controller_name.to_string(),
                handler_name: handler_name.to_string(),
                has_error,
            })
            .observe(elapsed.as_secs_f64());
    }
}

pub fn set_total_cached_objects(ctx: &str, group: &str, version: &str, kind: &str, count: i64) {
    if let Some(f) = &*FAMILIES {
        f.cached_objects
            .get_or_create(&CachedObjectLabels {
                ctx: ctx.to_string(),
                group: group.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
            })
            .set(count);
    }
}

pub fn set_cache_store_count(context: &str, kind: &str, count: i64) {
    if let Some(f) = &*FAMILIES {
        f.cache_store_count
            .get_or_create(&CacheStoreLabels {
                context: context.to_string(),
                kind: kind.to_string(),
            })
            .set(count);
    }
}

pub fn set_cache_started_count(context: &str, count: i64) {
    if let Some(f) = &*FAMILIES {
        f.cache_started_count
            .get_or_create(&CacheContextLabels {
                context: context.to_string(),
            })
            .set(count);
    }
}

fn queue_labels(name: &str) -> QueueLabels {
    QueueLabels {
        name: name.to_string(),
    }
}

pub fn set_queue_depth(name: &str, depth: i64) {
    if let Some(f) = &*FAMILIES {
        f.queue_depth.get_or_create(&queue_labels(name)).set(depth);
    }
}

pub fn inc_queue_adds(name: &str) {
    if let Some(f) = &*FAMILIES {
        f.queue_adds.get_or_create(&queue_labels(name)).inc();
    }
}

pub fn inc_queue_retries(name: &str) {
    if let Some(f) = &*FAMILIES {
        f.queue_retries.get_or_create(&queue_labels(name)).inc();
    }
}

pub fn observe_queue_duration(name: &str, elapsed: Duration) {
    if let Some(f) = &*FAMILIES {
        f.queue_duration
            .get_or_create(&queue_labels(name))
            .observe(elapsed.as_secs_f64());
    }
}

pub fn observe_work_duration(name: &str, elapsed: Duration) {
    if let Some(f) = &*FAMILIES {
        f.work_duration
            .get_or_create(&queue_labels(name))
            .observe(elapsed.as_secs_f64());
    }
}

pub fn set_unfinished_work(name: &str, seconds: f64) {
    if let Some(f) = &*FAMILIES {
        f.unfinished_work.get_or_create(&queue_labels(name)).set(seconds);
    }
}

pub fn set_longest_running_processor(name: &str, seconds: f64) {
    if let Some(f) = &*FAMILIES {
        f.longest_running.get_or_create(&queue_labels(name)).set(seconds);
    }
}
