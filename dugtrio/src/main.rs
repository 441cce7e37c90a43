use std::process::ExitCode;

use anyhow::Result;
use clap::{Error as ClapError, Parser as _};
use logging::{error_with_endpoints, info_with_endpoints};
use runtime::DugtrioArgs;

fn main() -> ExitCode {
    if let Err(error) = try_main() {
        error.downcast_ref().map(ClapError::exit);
        error_with_endpoints!("{error:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn try_main() -> Result<()> {
    let args = DugtrioArgs::try_parse()?;
    let config = runtime::load_config(&args)?;

    let _tracing_handle = binary_utils::initialize_tracing_logger(
        &config.logging.output_level,
        config.logging.file_path.as_deref(),
    )?;

    info_with_endpoints!(
        "starting {}",
        dugtrio_version::APPLICATION_VERSION_WITH_PLATFORM,
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(runtime::run(config))
}
