#![allow(dead_code)]
mod builders;
mod dot_server;

pub use builders::*;
pub use dot_server::*;
