//! Storage network collaborators.

mod lister;

pub use lister::{
    bytes_to_mb, total_mb, EmptyLister, GatewayLister, ObjectLister, StoredObject, BYTES_PER_MB,
};
