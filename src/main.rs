#[tokio::main]
async fn main() {
    let code = devctx::app::startup::startup().await;
    std::process::exit(code);
}
