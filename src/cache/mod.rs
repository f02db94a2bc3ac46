// Replicated cache handlers
//
// - store: shared per-cache state and the lease callbacks
// - handler: the client-facing read/write API
// - service: the seam to the actor sequencing cluster-wide mutations
// - backing, event, index, resource: storage, notification and value plumbing
// - snapshot: bulk transfer of issued leases to joining members

pub mod backing;
pub mod event;
pub mod handler;
pub mod index;
pub mod registry;
pub mod resource;
pub mod service;
pub mod snapshot;
pub mod store;

pub use backing::{
    BackingMap, BackingMapManager, BackingMapObserver, InMemoryBackingMap, InMemoryBackingMapManager,
    SuppressionToken,
};
pub use event::{
    CacheEvent, CacheEventKind, DeactivationListener, EventDispatcher, Filter, KeyPrefixFilter, KeySetFilter,
    ListenerSupport, MapListener,
};
pub use handler::CacheHandler;
pub use index::{IndexMap, PointerExtractor, ValueExtractor};
pub use registry::HandlerRegistry;
pub use resource::{JsonSerializer, Loader, Resource, Serializer};
pub use service::{on_service_thread, CacheService, ServiceContext, ServiceThreadGuard};
pub use snapshot::{CacheSnapshot, SnapshotCursor};
pub use store::{CacheStore, LeaseUpdate, UpdateOutcome};
