use std::env::consts::{ARCH, OS};

use const_format::concatcp;

pub const APPLICATION_NAME: &str = "dugtrio";
pub const APPLICATION_VERSION: &str = env!("CARGO_PKG_VERSION");

// The `X-Dugtrio-Version` response header and the startup banner use this.
pub const APPLICATION_NAME_AND_VERSION: &str =
    concatcp!(APPLICATION_NAME, "/", APPLICATION_VERSION);

pub const APPLICATION_VERSION_WITH_PLATFORM: &str =
    concatcp!(APPLICATION_NAME_AND_VERSION, "/", ARCH, "-", OS);
