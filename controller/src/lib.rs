mod controller;
mod error;
mod factory;
mod impersonation;
mod shared_controller;
mod shared_handler;
mod useragent;
pub mod workqueue;

#[cfg(test)]
mod test;

pub use controller::{Controller, Handler};
pub use error::{Error, Result};
pub use factory::{SharedControllerFactory, SharedControllerFactoryOptions};
pub use impersonation::SharedControllerFactoryWithImpersonation;
pub use shared_controller::SharedController;
pub use shared_handler::{SharedControllerHandler, SharedHandler, handler_fn};
pub use useragent::SharedControllerFactoryWithAgent;
