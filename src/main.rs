use isolar_bridge::prelude::*;

#[tokio::main]
async fn main() {
    if let Err(e) = isolar_bridge::app(Options::new()).await {
        error!("{:?}", e);
        eprintln!("isolar-bridge: {:#}", e);
        std::process::exit(255);
    }
}
