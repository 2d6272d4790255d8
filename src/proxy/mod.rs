// ABOUTME: Proxy routing model: the config string codec and endpoint port mappings
// ABOUTME: Pure functions only, no I/O

pub mod codec;
pub mod ports;

pub use codec::{decode_all, decode_owned, encode_rule, ProxyConfig, RouteRule};
pub use ports::{mapping_name, merge_owner_ports, port_mapping};
