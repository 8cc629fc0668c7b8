//! Shared building blocks used by every lokus plugin-host crate: the
//! message-error trait behind `impl_context!` and the typed lifecycle
//! [`EventBus`](events::EventBus).

pub mod error;
pub mod events;

pub use {
    error::FromMessage,
    events::{EventBus, Subscription},
};
