use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use aya::maps::{AsyncPerfEventArray, MapData};
use aya::util::online_cpus;
use bytes::BytesMut;
use log::{debug, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use rsops_common::TcpEvent;

/// Samples taken from a perf buffer per wakeup
const SAMPLES_PER_READ: usize = 16;

/// Counts shared by every per-CPU reader
#[derive(Debug, Default)]
pub struct DumpCounters {
    received: AtomicU64,
    lost: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DumpTotals {
    pub received: u64,
    pub lost: u64,
    pub malformed: u64,
}

impl DumpCounters {
    pub fn totals(&self) -> DumpTotals {
        DumpTotals {
            received: self.received.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// Decode one batch read from the buffer of `cpu` and hand every event to
    /// `on_event`.
    pub fn handle_batch<F>(&self, cpu: u32, samples: &[BytesMut], lost: usize, on_event: &F)
    where
        F: Fn(u32, TcpEvent),
    {
        if lost > 0 {
            warn!("lost {lost} events on cpu {cpu}");
            self.lost.fetch_add(lost as u64, Ordering::Relaxed);
        }

        for sample in samples {
            match TcpEvent::from_bytes(sample) {
                Some(event) => {
                    self.received.fetch_add(1, Ordering::Relaxed);
                    on_event(cpu, event);
                }
                None => {
                    debug!("short sample of {} bytes on cpu {cpu}", sample.len());
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// One reader task per online CPU draining the TCP event perf buffers.
pub struct TcpDump {
    readers: Vec<JoinHandle<()>>,
    counters: Arc<DumpCounters>,
}

impl TcpDump {
    pub fn start<F>(mut events: AsyncPerfEventArray<MapData>, pages: usize, on_event: F) -> Result<Self>
    where
        F: Fn(u32, TcpEvent) + Send + Sync + 'static,
    {
        let cpus = online_cpus().map_err(|(path, e)| anyhow!("failed to read {path}: {e}"))?;
        let counters = Arc::new(DumpCounters::default());
        let on_event = Arc::new(on_event);
        let mut readers = Vec::with_capacity(cpus.len());

        for cpu in cpus {
            let mut buf = events
                .open(cpu, Some(pages))
                .with_context(|| format!("failed to open perf buffer on cpu {cpu}"))?;
            let counters = Arc::clone(&counters);
            let on_event = Arc::clone(&on_event);

            readers.push(tokio::spawn(async move {
                let mut buffers = (0..SAMPLES_PER_READ)
                    .map(|_| BytesMut::with_capacity(TcpEvent::LEN))
                    .collect::<Vec<_>>();

                loop {
                    let batch = match buf.read_events(&mut buffers).await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!("perf buffer on cpu {cpu} failed, reader stopped: {e}");
                            break;
                        }
                    };
                    counters.handle_batch(cpu, &buffers[..batch.read], batch.lost, &*on_event);
                }
            }));
        }

        debug!("started {} perf readers with {pages} pages each", readers.len());
        Ok(Self { readers, counters })
    }

    /// Stop every reader and return what was seen.
    pub fn stop(self) -> DumpTotals {
        for reader in &self.readers {
            reader.abort();
        }
        self.counters.totals()
    }
}

pub fn dump_json(iface: &str, totals: &DumpTotals) -> serde_json::Value {
    serde_json::json!({
        "iface": iface,
        "events": totals,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}
