//! CLI command modules.

pub mod http;
pub mod shell;
pub mod status;
pub mod tunnel;
