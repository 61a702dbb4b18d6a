//! # aprsgate-link
//!
//! The upstream APRS-IS connection for aprsgate.
//!
//! One [`LinkManager`] holds the gateway's single connection to the APRS-IS
//! network. It logs in, reads lines, hands station-directed packets to a
//! [`PacketSink`] and reconnects forever on failure. Other components write
//! upstream through the [`Uplink`] trait.
//!
//! ```rust,ignore
//! use aprsgate_link::{LinkConfig, LinkManager, LoginLine};
//! use std::sync::Arc;
//!
//! let link = Arc::new(LinkManager::new(LinkConfig::new(
//!     "rotate.aprs.net:10152",
//!     LoginLine::new("K8SDR-10").with_filter("b/K8SDR*"),
//! )));
//! let (inbound, _) = engine.spawn_inbound();
//! tokio::spawn(link.clone().run(Arc::new(inbound)));
//! ```

pub mod login;
pub mod manager;
pub mod traits;

pub use login::{parse_logresp, Credential, LoginLine, LoginResponse};
pub use manager::{
    LineOutcome, LinkConfig, LinkManager, LinkStats, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_RECONNECT_DELAY, DEFAULT_WRITE_TIMEOUT, MAX_LINE_LENGTH,
};
pub use traits::{LinkError, LinkState, PacketSink, Uplink};
