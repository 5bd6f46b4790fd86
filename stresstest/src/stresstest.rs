use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use bytesize::ByteSize;
use champd::chunker::ChunkingStrategy;
use champd::client::{run_backup, BackupReport, ClientFile};
use sketches_ddsketch::DDSketch;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use crate::workload::{Action, Workload};

#[derive(Default)]
struct Totals {
    backups: u64,
    failures: u64,
    incremental: u64,
    logical_bytes: u64,
    sent_bytes: u64,
    blocks: u64,
    got: u64,
}

/// Backs up one dataset and returns how many bytes went over the wire.
async fn backup(
    addr: SocketAddr,
    files: Vec<(String, Vec<u8>)>,
) -> Result<(BackupReport, u64, u64)> {
    let mut chunked = Vec::with_capacity(files.len());
    for (path, data) in files {
        chunked.push(ClientFile::chunk(path, &data, ChunkingStrategy::default()).await?);
    }
    let logical: u64 = chunked.iter().map(ClientFile::len).sum();
    let lengths: Vec<u64> = chunked
        .iter()
        .flat_map(|file| file.blocks.iter().map(|(sig, _)| u64::from(sig.length)))
        .collect();

    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let report = run_backup(stream, chunked).await?;
    let sent = report
        .requested
        .iter()
        .map(|index| lengths[*index as usize])
        .sum();
    Ok((report, logical, sent))
}

pub async fn perform_stresstest(
    addr: SocketAddr,
    workloads: Vec<Workload>,
    duration: Duration,
) -> Result<()> {
    // run the workloads concurrently
    let tasks: Vec<_> = workloads.into_iter().map(|workload| {
         tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let deadline = tokio::time::Instant::now() + duration;

            let workload = Arc::new(Mutex::new(workload));

            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let totals = Arc::new(Mutex::new(Totals::default()));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let totals = Arc::clone(&totals);

                        let task = async move {
                            let (action, files) = {
                                let mut workload = workload.lock().unwrap();
                                let action = workload.next_action();
                                let files = workload.render(&action.dataset());
                                (action, files)
                            };
                            let task_start = Instant::now();
                            let result = match files {
                                Ok(files) => backup(addr, files).await,
                                Err(err) => Err(err.into()),
                            };

                            let mut totals = totals.lock().unwrap();
                            match result {
                                Ok((report, logical, sent)) => {
                                    task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());
                                    totals.backups += 1;
                                    totals.incremental += matches!(action, Action::Incremental(_)) as u64;
                                    totals.logical_bytes += logical;
                                    totals.sent_bytes += sent;
                                    totals.blocks += report.summary.blocks;
                                    totals.got += report.summary.got;
                                    workload.lock().unwrap().push_dataset(action.dataset());
                                }
                                Err(err) => {
                                    tracing::warn!(%err, "backup failed");
                                    totals.failures += 1;
                                }
                            }

                            drop(permit);
                        };
                        tokio::spawn(task);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = std::mem::take(&mut *task_durations.lock().unwrap());
            let totals = std::mem::take(&mut *totals.lock().unwrap());
            let workload = Arc::try_unwrap(workload).map_err(|_| anyhow::anyhow!("workload still shared"))?.into_inner().map_err(|_| anyhow::anyhow!("workload lock poisoned"))?;
            anyhow::Ok((workload, task_durations, totals))
        })
    }).collect();

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, task_durations, totals) = task??;

        let concurrency = workload.concurrency;
        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("# Workload {i}: {} (concurrency: {concurrency})", workload.name);
        println!(
            "  {} files per backup, sizes {}-{}, {:.0}% mutated per generation",
            workload.files_per_backup,
            ByteSize::b(workload.p50_size),
            ByteSize::b(workload.p99_size),
            workload.mutation_rate * 100.0,
        );
        println!(
            "=> {ops} backups ({} incremental, {} failed), {ops_ps:.2} backups/s",
            totals.incremental, totals.failures
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| Duration::from_secs_f64(task_durations.quantile(q).ok().flatten().unwrap_or_default());
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

        let block_ratio = totals.got as f64 / totals.blocks.max(1) as f64;
        let byte_ratio = totals.logical_bytes as f64 / totals.sent_bytes.max(1) as f64;
        println!(
            "  {} backed up, {} sent; {:.1}% of blocks deduplicated, {byte_ratio:.2}x dedup ratio",
            ByteSize::b(totals.logical_bytes),
            ByteSize::b(totals.sent_bytes),
            block_ratio * 100.0,
        );
    }

    Ok(())
}
