//! Marea: live cache synchronization for clients of a shared remote store.
//!
//! A client application shows and edits records that other actors mutate
//! concurrently. Marea keeps the local read cache honest:
//!
//! - **[`ChangeEventChannel`]** owns one physical connection to the store's
//!   change-notification stream and multiplexes every feature's table
//!   interest over it, reconnecting with backoff when the transport drops.
//! - **[`SubscriptionRegistry`]** composes per-feature interest
//!   declarations into the channel's desired table set, reference-counted
//!   by live [`SubscriptionHandle`]s.
//! - **[`affected_patterns`]** maps a changed table to the cache key
//!   patterns it invalidates: its own keys plus a manually curated set of
//!   derived aggregate views.
//! - **[`QueryCache`]** serves reads stale-while-revalidate: invalidation
//!   marks entries stale without blanking them, and concurrent freshness
//!   requests coalesce into a single fetch per key.
//! - **[`CacheInvalidator`]** glues the stream to the cache, one serialized
//!   pass per delivered event.
//!
//! [`SyncRuntime`] wires all of it together behind the [`ChangeTransport`]
//! seam; the embedding application injects whatever actually carries the
//! notifications.

pub mod channel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod keys;
mod lock;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod tables;
pub mod telemetry;
pub mod transport;
pub mod trigger;

pub use channel::ChangeEventChannel;
pub use config::{LogFormat, LogLevel, LoggingSettings, SyncSettings};
pub use consumer::CacheInvalidator;
pub use error::{ConnectionError, FetchError, MutationError, SyncError};
pub use events::{ChangeEvent, ChangeKind, Epoch, EpochCounter, EventOrigin};
pub use invalidation::affected_patterns;
pub use keys::{CacheKey, DerivedView, KeyPart, KeyPattern, KeyRoot, PrincipalId};
pub use registry::{SubscriptionHandle, SubscriptionRegistry};
pub use runtime::SyncRuntime;
pub use store::{EntrySnapshot, EntryStatus, Fetcher, KeyWatch, QueryCache};
pub use tables::{TableId, TableSet};
pub use transport::{ChangeStream, ChangeTransport};
pub use trigger::WriteTrigger;
