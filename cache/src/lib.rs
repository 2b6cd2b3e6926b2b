mod backoff;
mod error;
mod factory;
mod health;
mod informer;
pub mod keys;
mod store;

pub use error::{Error, Result};
pub use factory::{SharedCacheFactory, SharedCacheFactoryOptions, gvk_of};
pub use health::{HealthCallback, HealthCheck};
pub use informer::{Event, Informer, InformerOptions, TweakListFn};
pub use store::{IndexFunc, Store};
