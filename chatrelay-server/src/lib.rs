pub mod feed;
pub mod ingest;
pub mod render;
pub mod store;

pub use feed::{ChangeFeed, Snapshot};
pub use ingest::{
    DatagramSource, IngestError, IngestHandle, IngestLoop, IngestState, RecordWriter,
};
pub use store::{ChatDatabase, MessageStore, PeerStore, StorageError};
