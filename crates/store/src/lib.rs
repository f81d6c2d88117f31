//! Persistence for flowbot.
//!
//! Every write to the external record store goes through one [`WriteQueue`]:
//! a single worker drains a FIFO, one task at a time, retrying each task
//! under a [`RetryPolicy`]. The contact and order books build complete rows
//! and hand them to the queue.

pub mod contacts;
pub mod in_memory;
pub mod orders;
pub mod queue;

pub use contacts::{CONTACT_COLUMNS, ContactBook, extract_contact_fields};
pub use in_memory::{InMemoryRecordStore, InMemoryStateStore};
pub use orders::{OrderBook, PlacedOrder};
pub use queue::{RetryPolicy, WriteError, WriteQueue};
