//! Change-source integration: the watchman service.
//!
//! `client` speaks the JSON-per-line protocol over the service's unix
//! socket; `adapter` turns registrations, queries and subscription events
//! into normalized [`pdsync_domain::FileChange`] batches.

pub mod adapter;
pub mod client;

pub use adapter::ChangeSourceAdapter;
pub use client::{discover_socket, QueryResponse, SubscriptionEvent, WatchmanClient};
