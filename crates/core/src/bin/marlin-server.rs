use clap::Parser;
use marlin::config::{set_logger, ConfigArgs};

fn main() -> anyhow::Result<()> {
    let args = ConfigArgs::parse();
    let config = args.build()?;
    set_logger(Some(config.log_level));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?;
    rt.block_on(marlin::server::serve(config))
}
