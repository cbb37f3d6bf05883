//! Device-bridge core: transport lifecycle, channel multiplexing, and
//! service routing.
//!
//! `tether` turns one unreliable byte stream per remote endpoint into
//! many concurrently usable virtual streams with credit-based flow
//! control, reconnection, and capability negotiation.
//!
//! # Quick start
//!
//! ```no_run
//! use tether::{Hub, HubConfig, ServiceHooks, ServiceRouter};
//!
//! let router = ServiceRouter::new(ServiceHooks::default());
//! let hub = Hub::new(HubConfig::device(), router);
//! let handle = hub.handle();
//!
//! tether::backends::tcp::spawn_listener(handle, 5555).expect("listener");
//!
//! // Takes over the calling thread until shutdown.
//! hub.run();
//! ```

pub mod backends;
mod banner;
mod channel;
mod error;
mod hub;
mod mux;
mod registry;
mod router;
pub mod services;
mod transport;

pub use banner::BannerConfig;
pub use error::{Error, Result};
pub use hub::{AuthConfig, AuthSigner, AuthVerifier, Hub, HubConfig, HubHandle};
pub use registry::TransportRegistry;
pub use router::{AdmissionFn, RestartRequest, Routed, ServiceHooks, ServiceRouter, WorkerHook};
pub use services::{ServiceStream, spawn_worker};
pub use transport::{
    Connection, ConnectionState, ReconnectDecision, ReconnectPolicy, Transport, TransportKind,
    abort_reconnect,
};
