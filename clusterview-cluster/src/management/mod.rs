//! Sessions with member management endpoints

pub mod http;
pub mod link;
pub mod local;

pub use http::{HttpConnector, HttpManagementLink};
pub use link::{ManagementConnector, ManagementLink};
pub use local::{LocalConnector, LocalPeer};
