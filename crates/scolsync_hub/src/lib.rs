//! # scolsync Hub
//!
//! The LAN side of a site: zero-configuration discovery of peer instances,
//! the realtime HTTP hub several browsers use to co-edit one device's store,
//! and the staging area for manual peer-to-peer transfers.
//!
//! This crate provides:
//! - [`Discovery`]: mDNS advertise/browse with a watch-channel peer set
//! - [`Hub`]: an axum server on an ephemeral port (event stream, class
//!   projections, atomic grade batches, transfer intake, SPA fallback)
//! - [`EventBroadcaster`]: the pruned per-subscriber fan-out behind
//!   `GET /api/events`
//! - [`Staging`]: store-and-forward files awaiting explicit user acceptance
//!
//! Discovery trusts the local network segment: it is advisory only and never
//! itself transfers data.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod discovery;
mod error;
mod events;
mod server;
mod staging;

pub use discovery::{Discovery, DiscoveryConfig, Peer};
pub use error::{HubError, HubResult};
pub use events::{ChangeEvent, EventBroadcaster};
pub use server::{Hub, HubConfig, HubHandle};
pub use staging::{PendingTransfer, Staging, TransferPayload};
