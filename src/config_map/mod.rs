// Coordinator-serialized configuration map
//
// One member at a time (the oldest) applies writes service-wide. Everyone
// else routes writes to it as polled requests and defers updates that
// arrive from anyone else until a membership change settles who is in
// charge.

pub mod listener;
pub mod map;
pub mod message;
pub mod policy;

pub use listener::ConfigListener;
pub use map::ConfigMap;
pub use message::{ConfigMessage, ConfigTransport, PollId};
pub use policy::{ApplyLocally, FailFast, MissingCoordinatorPolicy};
