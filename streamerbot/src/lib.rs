//! Client for the Streamer.bot WebSocket server.
//!
//! ```rust,no_run
//! use streamerbot::{ClientOptions, StreamerbotClient, SubscriptionSpec};
//!
//! # async fn example() -> streamerbot::Result<()> {
//! let client = StreamerbotClient::new(ClientOptions {
//!     immediate: false,
//!     ..Default::default()
//! });
//! client.connect().await?;
//! client
//!     .on(["Twitch.ChatMessage"], |event| println!("{}", event.data))
//!     .await?;
//! client
//!     .subscribe(SubscriptionSpec::default().with("Twitch", ["Follow"]))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bridge;
pub mod catalog;
mod client;
pub mod correlator;
pub mod dispatch;
mod error;
mod handlers;
pub mod message;
mod options;
mod requests;
pub mod subscription;
pub mod transport;

pub use auth::AuthStatus;
pub use catalog::EventCatalog;
pub use client::{ClientBuilder, ConnectionState, StreamerbotClient};
pub use dispatch::ListenerId;
pub use error::{Error, Result, close_reason};
pub use handlers::EventHandlers;
pub use message::{Event, EventEnvelope, InstanceInfo, Request, Response};
pub use options::{ClientOptions, ReconnectOptions, Scheme, Timeouts};
pub use requests::{ActionRef, Platform};
pub use subscription::{EventPattern, SubscriptionSet, SubscriptionSpec};
