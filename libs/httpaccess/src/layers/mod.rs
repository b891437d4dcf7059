//! Tower layers of the pooled client
//!
//! - [`ConnectionLimitLayer`] - Caps connections in use, in total and per route
//! - [`RedirectPolicy`] - Transparent redirect following with a hop limit

mod limit;
mod redirect;

pub use limit::{ConnectionLimitLayer, ConnectionLimitService};
pub use redirect::RedirectPolicy;
