//! Server side of the tether RPC framework.
//!
//! # Features
//!
//! - **Explicit registration**: Typed async handlers wrapped into uniform adapters
//! - **Concurrent dispatch**: Every request runs on its own task
//! - **Graceful shutdown**: Stop reading, drain in-flight calls, then close
//! - **Hooks**: Authentication and plugin hooks around every stage
//!
//! # Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use tether_server::{Context, Server, ServerConfig, ServiceBuilder, ServiceError};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     a: i64,
//!     b: i64,
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::default());
//!     server.register(ServiceBuilder::new("Arith").method(
//!         "Mul",
//!         |_ctx: Context, args: Args| async move { Ok::<_, ServiceError>(args.a * args.b) },
//!     ))?;
//!
//!     server.listen("127.0.0.1:8972").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod server;

pub use context::Context;
pub use error::{DispatchError, RegistryError, Result, ServerError, ServiceError};
pub use plugin::{Plugin, PluginContainer};
pub use registry::{MethodDescriptor, MethodHandler, Registry, ServiceBuilder};
pub use server::{AuthFn, Server, ServerConfig};
