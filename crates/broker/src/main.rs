//! Binary entry point. The router, actor wiring, and handlers all live in
//! `lib.rs` so integration tests can drive them directly.

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = broker::config::Args::parse();
    broker::logging::init(args.log_format);

    if let Err(error) = broker::run(args).await {
        tracing::error!(error = %broker::logging::err_with_src(&*error), "broker exited");
        return Err(error);
    }
    Ok(())
}
