#![deny(unused_crate_dependencies)]
#![deny(unused_must_use)]

pub mod adapter;
pub mod listener;
pub mod log;
pub mod ports;
pub mod provider;
pub mod sync;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use adapter::{
    DepositView,
    EscrowStatus,
    EthAdapter,
    EthAdapterConfig,
};
pub use listener::{
    EthListener,
    EthListenerConfig,
};
pub use ports::EthNode;
pub use provider::JsonRpcEthNode;
