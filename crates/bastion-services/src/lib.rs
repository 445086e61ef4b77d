//! bastion-services — shared server state: the session registry, the
//! on-disk file store, pending relay negotiations, key material, and the
//! event stream.

pub mod events;
pub mod keyring;
pub mod registry;
pub mod relay;
pub mod store;

pub use events::{EventSink, ServerEvent, TracingSink};
pub use keyring::{is_valid_username, KeyRepository, ServerIdentity};
pub use registry::{Session, SessionRegistry};
pub use relay::{PendingRelay, PendingRelays};
pub use store::{FileId, FileStore};
