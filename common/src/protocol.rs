pub const HEADER_TOKEN: &str = "wom-token";
pub const HEADER_IP: &str = "wom-ip";

pub const WOL_PORT: u16 = 9;
pub const SHUTDOWN_PORT: u16 = 40004;
pub const SHUTDOWN_MAGIC: &[u8] = b"wom_shutdown";
