pub use announcer::*;
pub use cache::*;
pub use compact::*;
pub use config::*;
pub use errors::*;
pub use request::*;

mod announcer;
pub mod bencode;
mod cache;
mod compact;
mod config;
mod errors;
mod http;
mod request;
mod transport;
mod udp;
