//! Small shared helpers: deterministic host identity, address discovery,
//! port-range parsing, random ids and the shutdown latch used by the
//! control-session tasks.

mod id;
mod net;
mod range;
mod shutdown;
mod unique_id;

pub use id::{rand_id, rand_id_with_len};
pub use net::internal_ip;
pub use range::{parse_range_numbers, RangeError};
pub use shutdown::{Event, Shutdown};
pub use unique_id::{primary_mac, unique_id};
