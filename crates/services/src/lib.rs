#![deny(unused_crate_dependencies)]
#![deny(unused_must_use)]

mod retry;
mod service;

pub use retry::{
    retry_with_policy,
    RetryPolicy,
};
pub use service::{
    Service,
    RunnableService,
    ServiceRunner,
    State,
    StateWatcher,
};
