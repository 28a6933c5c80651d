//! rudis is an asynchronous Redis client built on tokio.
//!
//! A [`Connection`] owns one byte stream to the server, speaks RESP2 or
//! RESP3 (negotiated via `HELLO`), pipelines requests up to a
//! configurable depth with strict FIFO reply pairing, multiplexes
//! pub/sub messages onto per-subscription streams, serializes
//! MULTI/EXEC transactions, and can keep a bounded client-side cache of
//! `GET` replies evicted by server invalidation traffic.
//!
//! # Basic operation
//!
//! ```no_run
//! use rudis::{cmd, Config, Connection};
//!
//! # async fn example() -> rudis::RedisResult<()> {
//! let connection = Connection::connect(Config::new().with_host("localhost")).await?;
//! connection.set("foo", "bar").await?;
//! let value = connection.get("foo").await?;
//!
//! // Every typed wrapper is sugar over `execute`.
//! let size = connection.execute(cmd("DBSIZE")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Pub/sub
//!
//! ```no_run
//! # async fn example(connection: rudis::Connection) -> rudis::RedisResult<()> {
//! let mut streams = connection.subscribe(["news"]).await?;
//! if let Some(message) = streams[0].recv().await {
//!     println!("{:?}", message.payload);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Transactions
//!
//! ```no_run
//! # async fn example(connection: rudis::Connection) -> rudis::RedisResult<()> {
//! use rudis::cmd;
//!
//! let (successes, failures) = connection
//!     .multi(|tx| async move {
//!         // Each queued command's future resolves from the EXEC array.
//!         let _set = tx.execute(cmd("SET").arg("a").arg(1).clone());
//!         let _incr = tx.execute(cmd("INCR").arg("a").clone());
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod macros;

mod cache;
mod cmd;
mod commands;
mod config;
mod connection;
mod driver;
mod parser;
mod subscription;
mod transaction;
mod types;

pub use crate::cmd::{cmd, Cmd};
pub use crate::config::{Config, DEFAULT_PIPELINE_DEPTH, DEFAULT_STREAM_BUF_LEN};
pub use crate::connection::{Connection, ConnectionEvent};
pub use crate::parser::ValueCodec;
pub use crate::subscription::{Message, MessageKind, MessageStream, SubscriptionKind};
pub use crate::transaction::MultiHandle;
pub use crate::types::{
    ErrorKind, ProtocolVersion, PushKind, RedisError, RedisResult, ServerError, ToRedisArgs,
    Value, VerbatimFormat,
};
