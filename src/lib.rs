pub mod binenc;
pub mod client;
pub mod config;
pub mod msg;
pub mod netmsg;
pub mod netxfer;
pub mod udpconn;
pub mod test_util;
