//! Outbox + inbox reliability substrate (§4.6).

pub mod inbox;
pub mod outbox;
pub mod postgres;

pub use inbox::{InMemoryInboxStore, InboxStore};
pub use outbox::{InMemoryOutboxStore, OutboxDispatcher, OutboxDispatcherConfig, OutboxStore};
pub use postgres::{PostgresInboxStore, PostgresOutboxStore};
