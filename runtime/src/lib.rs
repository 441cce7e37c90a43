pub use crate::{
    args::DugtrioArgs,
    config::load_config,
    runtime::run,
};

mod args;
mod config;
mod runtime;
