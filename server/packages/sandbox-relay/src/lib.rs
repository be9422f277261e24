//! Sandbox relay server: project lifecycle endpoints and the agent proxy.

pub mod cli;
pub mod projects;
pub mod proxy;
pub mod proxy_status;
pub mod router;
pub mod supervisor;
