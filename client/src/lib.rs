mod builder;
mod client;
mod error;
mod factory;
mod options;

pub use k8s_openapi;
pub use kube;

pub use client::{Client, WatchStream};
pub use error::{Error, Result};
pub use factory::{
    SharedClientFactory, SharedClientFactoryOptions, SharedClientFactoryWithAgent,
    SharedClientFactoryWithImpersonation,
};
pub use options::{
    CreateOptions, DeleteOptions, GetOptions, ImpersonationConfig, ListOptions, Options,
    PatchOptions, UpdateOptions, WarningHandler, WatchOptions,
};
