#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod proto;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use command::{CommandError, CommandState};
pub use ws::{ConnectionManager, ConnectionState};
