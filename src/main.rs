mod app;
mod broadcast;
mod line;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
