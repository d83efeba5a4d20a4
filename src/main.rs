use std::path::PathBuf;

use gcodelink::{init_logging, load_config, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = load_config(path.as_deref())?;
    serve(config).await
}
