#![deny(unused_crate_dependencies)]
#![deny(unused_must_use)]

mod amount;
mod error;
mod event;
mod id;
mod secret;
mod swap;

pub use amount::Amount;
pub use error::{
    Chain,
    ConfigIssue,
    ContractReason,
    ErrorSnapshot,
    RelayerError,
    SecurityIssue,
    StorageOperation,
};
pub use event::{
    ChainEvent,
    EventMeta,
    WorkItem,
};
pub use id::MessageId;
pub use secret::{
    Secret,
    SecretHash,
};
pub use swap::{
    Direction,
    EscrowRef,
    Swap,
    SwapStatus,
};
