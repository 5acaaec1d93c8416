//! Network attribution: who owns which port, and how many bytes crossed it.
//!
//! Capture workers (`sniffer`) parse every frame (`parser`) and charge its
//! wire length to a per-port counter (`counters`). Once per tick the
//! sampling loop sums those counters through the port ownership map
//! (`ports`) and resets them.

pub mod counters;
pub mod parser;
pub mod ports;
pub mod sniffer;

pub use counters::{PORT_SPACE, PortCounters};
pub use parser::{Charge, LinkKind, PacketPorts, charge_for, parse_frame};
pub use ports::PortMap;
pub use sniffer::{SniffError, Sniffer};
