//! Jobs Worker Service - Entry Point
//!
//! Consumes versioned jobs from the default queue until idle or signalled.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jobs_worker::run().await
}
