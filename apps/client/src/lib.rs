pub mod api;
pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod messaging;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod realtime;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
pub mod validation;

#[cfg(test)]
mod testing;
