//! Async STUN/TURN client.
//!
//! The [`Client`] sends STUN Binding requests to discover the server
//! reflexive address of a host, and creates TURN relay [`Allocation`]s
//! through which data is exchanged with peers.
//!
//! Requests are matched to responses by transaction id. A single dispatch
//! task, started by [`Client::listen`], reads every message received on the
//! client's [`Transport`] and completes the transaction waiting for it, or
//! forwards relayed data to the allocation. Any number of tasks can issue
//! requests concurrently.
//!
//! Allocations authenticate with the long-term credential mechanism. Stale
//! nonce rejections are recovered transparently: the nonce is refreshed once,
//! even when several requests are rejected at the same time, and the rejected
//! requests are retried once with it.
//!
//! ```no_run
//! # use turn_client::{Client, ClientBuilder, TurnError};
//! # async fn run() -> Result<(), TurnError> {
//! let builder = ClientBuilder::default()
//!     .with_turn_server("192.0.2.1:3478".parse().unwrap())
//!     .with_credentials("user", "password");
//! let client = Client::bind("0.0.0.0:0", builder).await?;
//! client.listen()?;
//!
//! let allocation = client.allocate().await?;
//! let peer = "198.51.100.7:5000".parse().unwrap();
//! allocation.write_to(b"hello", peer).await?;
//!
//! let mut buffer = [0u8; 1500];
//! let (size, from) = allocation.read_from(&mut buffer).await?;
//! # Ok(())
//! # }
//! ```

mod allocation;
mod auth;
mod binding;
mod client;
mod error;
mod message;
mod permission;
mod state;
mod timeout;
mod transaction;
mod transport;

pub use crate::allocation::Allocation;
pub use crate::auth::Credentials;
pub use crate::binding::{
    BindingMap, BindingState, ChannelBinding, MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER,
};
pub use crate::client::{
    Client, ClientBuilder, DEFAULT_CHANNEL_REFRESH, DEFAULT_LIFETIME, DEFAULT_PERMISSION_REFRESH,
};
pub use crate::error::{Result, TurnError};
pub use crate::message::{create_stun_message, RelayProtocol, StunAttributes};
pub use crate::permission::{ip_fingerprint, Permission, PermissionMap, PermissionState};
pub use crate::state::AllocationState;
pub use crate::timeout::{RtoSchedule, DEFAULT_RC, DEFAULT_RM, DEFAULT_RTO};
pub use crate::transaction::{Transaction, TransactionMap, TransactionResponse, TransactionResult};
pub use crate::transport::{StunTcpTransport, Transport, UdpTransport};
