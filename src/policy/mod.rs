//! Network policy: address classification and admission rules

pub mod classify;
mod engine;

pub use classify::{classify, in_cidr_set, AddressClass};
pub use engine::{check_inbound, resolve_and_check, PinnedTarget};
