pub mod errors;
mod import;
pub mod udp;

pub use self::import::{run, Import};
pub use self::udp::UdpImporter;
