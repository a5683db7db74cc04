#![forbid(unsafe_code)]

pub mod assemble;
pub mod assets;
pub mod browser;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod formats;
pub mod fsutil;
pub mod imaging;
pub mod logging;
pub mod naming;
pub mod package;
pub mod pipeline;
pub mod screenshots;
pub mod shared;
pub mod thumbs;
pub mod vault;
