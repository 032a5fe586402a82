#[tokio::main]
async fn main() {
    match stemflow_app::run_from_env().await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            tracing::error!("{error:#}");
            std::process::exit(1);
        }
    }
}
