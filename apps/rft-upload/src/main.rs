//! Sends one file to an rft receiver.
//!
//! Usage: `rft-upload <job.toml>`

mod job;

use std::path::PathBuf;

use rft_data_channel::UploadClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::job::Job;

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let job_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("usage: rft-upload <job.toml>"))?;
    let job = Job::load(&job_path)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(job))
}

async fn run(job: Job) -> anyhow::Result<()> {
    let addr = job.resolve_addr().await?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, pausing upload");
            ctrl_c.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel::<(u64, u64)>(16);
    let progress = tokio::spawn(async move {
        let mut last_pct = None;
        while let Some((done, total)) = progress_rx.recv().await {
            let pct = if total == 0 { 100 } else { done * 100 / total };
            if last_pct != Some(pct) {
                tracing::info!(done, total, "{pct}%");
                last_pct = Some(pct);
            }
        }
    });

    tracing::info!(
        source = %job.source.display(),
        %addr,
        resume = job.request.resume,
        "starting upload"
    );
    let result = UploadClient::upload(addr, &job.request, &job.source, cancel, progress_tx).await;
    let _ = progress.await;

    let report = result?;
    tracing::info!(
        path = %report.resolved_path,
        resumed_from = report.resume_offset,
        bytes_sent = report.bytes_sent,
        "upload finished"
    );
    println!("{}", report.resolved_path);
    Ok(())
}
