#![allow(ambiguous_glob_reexports)]

pub mod initialize;
pub mod update_config;
pub mod request;
pub mod settle;
pub mod settle_with_error;
pub mod close_request;
pub mod close_config;

pub use initialize::*;
pub use update_config::*;
pub use request::*;
pub use settle::*;
pub use settle_with_error::*;
pub use close_request::*;
pub use close_config::*;
