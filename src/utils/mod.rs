//! Process bootstrap and retry policies shared by the broker.

pub mod bootstrap;
pub mod retry;
