pub mod cache;
pub mod kv;

#[cfg(feature = "etcd")]
pub mod etcd;

#[cfg(feature = "etcd")]
pub mod schema;

#[cfg(feature = "etcd")]
pub mod watcher;
