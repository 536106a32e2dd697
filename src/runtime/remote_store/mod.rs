mod in_memory;
mod store;

pub use in_memory::InMemoryRemoteStore;
pub use store::{
    decode, decode_all, encode, ChangeEvent, ChangeFilter, ChangeKind, ChangeSink, Query,
    RemoteError, RemoteStore, Subscription, Table,
};
