//! Progress reporting.
//!
//! Each node accumulates per-task counters and ships a sample to rank 0
//! whenever the accumulated task time passes the reporting interval. Rank
//! 0 logs throughput per node until every node has said it is done with
//! the batch.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use xorstor_common::Result;
use xorstor_transport::{Rank, Transport};

use crate::channels;
use crate::executor::TaskOutcome;

const MIB: f64 = 1024.0 * 1024.0;

/// Counters since the previous sample plus running totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub dt: f64,
    pub nfiles: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub total_time: f64,
    pub total_nfiles: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
}

impl ProgressSample {
    fn add(&mut self, elapsed: Duration, outcome: &TaskOutcome) {
        if !outcome.involved {
            return;
        }
        let dt = elapsed.as_secs_f64();
        self.dt += dt;
        self.total_time += dt;
        self.nfiles += 1;
        self.total_nfiles += 1;
        self.bytes_read += outcome.bytes_read;
        self.total_bytes_read += outcome.bytes_read;
        self.bytes_written += outcome.bytes_written;
        self.total_bytes_written += outcome.bytes_written;
    }

    const fn reset_interval(&mut self) {
        self.dt = 0.0;
        self.nfiles = 0;
        self.bytes_read = 0;
        self.bytes_written = 0;
    }

    #[allow(clippy::cast_precision_loss)]
    fn describe(&self) -> String {
        let moved = (self.bytes_read + self.bytes_written) as f64 / MIB;
        let (rate, files_rate) = if self.dt > 0.0 {
            (moved / self.dt, self.nfiles as f64 / self.dt)
        } else {
            (0.0, 0.0)
        };
        format!(
            "{:>8} files | {:>10.1} MiB read | {:>10.1} MiB written | {:>8.1} MiB/s | {:>8.0} files/s",
            self.total_nfiles,
            self.total_bytes_read as f64 / MIB,
            self.total_bytes_written as f64 / MIB,
            rate,
            files_rate
        )
    }
}

/// Message on the progress channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProgressMessage {
    Sample(ProgressSample),
    /// The sender has finished the current batch
    Done,
}

/// Accumulates this node's task outcomes and forwards samples.
pub struct ProgressReporter<'a> {
    transport: &'a dyn Transport,
    sink: Rank,
    interval: Duration,
    sample: ProgressSample,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(transport: &'a dyn Transport, interval: Duration) -> Self {
        Self {
            transport,
            sink: 0,
            interval,
            sample: ProgressSample::default(),
        }
    }

    pub fn record(&mut self, elapsed: Duration, outcome: &TaskOutcome) -> Result<()> {
        self.sample.add(elapsed, outcome);
        if self.sample.dt >= self.interval.as_secs_f64() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.sample.dt > 0.0 || self.sample.nfiles > 0 {
            self.send(&ProgressMessage::Sample(self.sample))?;
            self.sample.reset_interval();
        }
        Ok(())
    }

    /// Flush and tell rank 0 this node finished the batch.
    ///
    /// Returns the running totals.
    pub fn finish_batch(&mut self) -> Result<ProgressSample> {
        self.flush()?;
        self.send(&ProgressMessage::Done)?;
        Ok(self.sample)
    }

    fn send(&self, message: &ProgressMessage) -> Result<()> {
        let payload = Bytes::from(bincode::serialize(message)?);
        self.transport.send(self.sink, channels::PROGRESS, payload)
    }
}

/// Log samples from every rank until each has finished the batch.
///
/// Runs on rank 0 only. Returns the last sample seen per rank.
pub fn receive_loop(transport: &dyn Transport) -> Result<Vec<ProgressSample>> {
    let world = transport.world_size();
    let mut latest = vec![ProgressSample::default(); world];
    let mut pending = world;
    while pending > 0 {
        let (rank, payload) = transport.recv_any(channels::PROGRESS)?;
        match bincode::deserialize::<ProgressMessage>(&payload)? {
            ProgressMessage::Sample(sample) => {
                info!("rank {:>2} - {}", rank, sample.describe());
                if let Some(slot) = latest.get_mut(rank) {
                    *slot = sample;
                }
            }
            ProgressMessage::Done => {
                debug!("Rank {} finished its batch", rank);
                pending -= 1;
            }
        }
    }
    Ok(latest)
}
