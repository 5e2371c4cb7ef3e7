use clap::Parser;
use truvis_gltf_app::app::{StreamApp, StreamArgs};

fn main() -> anyhow::Result<()> {
    let args = StreamArgs::parse();
    let mut app = StreamApp::new(&args)?;
    app.run();
    Ok(())
}
