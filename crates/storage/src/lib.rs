#![deny(unused_crate_dependencies)]
#![deny(unused_must_use)]

mod file;
mod paths;
mod store;
mod task;

pub use paths::resolve_storage_dir;
pub use store::{
    StatusStore,
    StoreError,
    SwapStats,
};
pub use task::{
    spawn_store,
    StoreHandle,
};
