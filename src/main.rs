#[tokio::main]
async fn main() {
    if let Err(err) = handoff_server::app::run().await {
        eprintln!("handoff-server failed: {err}");
        std::process::exit(1);
    }
}
