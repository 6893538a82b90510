#![deny(unused_crate_dependencies)]
#![deny(unused_must_use)]

pub mod adapter;
pub mod listener;
pub mod logs;
pub mod ports;
pub mod rpc;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use adapter::{
    NearAdapter,
    NearAdapterConfig,
    OrderStatus,
    OrderView,
};
pub use listener::{
    NearListener,
    NearListenerConfig,
};
pub use ports::NearRpc;
pub use rpc::JsonRpcNearNode;
