//! Client side of the tether RPC framework.
//!
//! [`RpcClient`] talks to one server over a single multiplexed connection.
//! [`XClient`] sits on top: it follows a [`ServiceDiscovery`] feed, picks a
//! server per call with a [`Selector`], and applies a [`FailMode`] and an
//! optional [`Breaker`] to failed attempts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_client::{
//!     ClientConfig, FailMode, KvPair, MultipleServersDiscovery, SelectMode, XClient,
//! };
//!
//! async fn example() -> tether_client::Result<()> {
//!     let discovery = Arc::new(MultipleServersDiscovery::new(vec![
//!         KvPair::new("127.0.0.1:8972", "weight=2"),
//!         KvPair::new("127.0.0.1:8973", "weight=1"),
//!     ]));
//!     let client = XClient::new(
//!         "Arith",
//!         FailMode::Failover,
//!         SelectMode::WeightedRoundRobin,
//!         discovery,
//!         ClientConfig::default(),
//!     );
//!
//!     let product: i64 = client
//!         .call("Mul", &serde_json::json!({ "a": 7, "b": 8 }))
//!         .await?;
//!     assert_eq!(product, 56);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod breaker;
pub mod client;
pub mod discovery;
pub mod error;
pub mod selector;
pub mod singleflight;
pub mod xclient;

pub use breaker::{Breaker, ConsecutiveBreaker};
pub use client::{BreakerFactory, ClientConfig, PendingCall, Reply, RpcClient};
pub use discovery::{
    DiscoveryWatch, KvPair, MultipleServersDiscovery, PeerToPeerDiscovery, ServiceDiscovery,
    ServiceFilter,
};
pub use error::{ClientError, Result};
pub use selector::{
    ConsistentHashSelector, RandomSelector, RoundRobinSelector, SelectMode, Selector,
    WeightedRoundRobinSelector, new_selector,
};
pub use singleflight::SingleFlight;
pub use xclient::{FailMode, XClient};
