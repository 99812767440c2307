use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use aya::maps::{HashMap, MapData, MapError, PerCpuArray};
use serde::Serialize;

use rsops_common::{FlowKey, RX_COUNT_INDEX};

/// One row of the flow count table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowRecord {
    pub key: u64,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub packets: i64,
}

impl FlowRecord {
    pub fn new(key: FlowKey, packets: i64) -> Self {
        Self {
            key: key.as_u64(),
            source: key.source(),
            destination: key.destination(),
            packets,
        }
    }
}

/// Reads the flow count table filled by the socket filter
pub struct FlowStats {
    flows: HashMap<MapData, FlowKey, i64>,
}

impl FlowStats {
    pub fn new(flows: HashMap<MapData, FlowKey, i64>) -> Self {
        Self { flows }
    }

    /// All flows currently in the table, busiest first
    pub fn snapshot(&self) -> Result<Vec<FlowRecord>, MapError> {
        let mut records = self
            .flows
            .iter()
            .map(|entry| entry.map(|(key, packets)| FlowRecord::new(key, packets)))
            .collect::<Result<Vec<_>, _>>()?;
        sort_records(&mut records);
        Ok(records)
    }

    /// Read and delete every flow, one key at a time, busiest first.
    ///
    /// Each key is looked up and deleted back to back and the value read just
    /// before the delete is reported. Packets counted for a key between its
    /// lookup and its delete are lost.
    pub fn drain(&mut self) -> Result<Vec<FlowRecord>, MapError> {
        let keys = self.flows.keys().collect::<Result<Vec<_>, _>>()?;
        let flows = &mut self.flows;
        take_each(keys, |key| {
            let packets = match flows.get(key, 0) {
                Ok(packets) => packets,
                Err(MapError::KeyNotFound) => return Ok(None),
                Err(e) => return Err(e),
            };
            match flows.remove(key) {
                Ok(()) | Err(MapError::KeyNotFound) => Ok(Some(packets)),
                Err(e) => Err(e),
            }
        })
    }
}

/// Take the count of each key with `take`, skipping keys that vanished in
/// the meantime.
pub fn take_each<I, F>(keys: I, mut take: F) -> Result<Vec<FlowRecord>, MapError>
where
    I: IntoIterator<Item = FlowKey>,
    F: FnMut(&FlowKey) -> Result<Option<i64>, MapError>,
{
    let mut records = Vec::new();
    for key in keys {
        if let Some(packets) = take(&key)? {
            records.push(FlowRecord::new(key, packets));
        }
    }
    sort_records(&mut records);
    Ok(records)
}

/// Per-flow totals accumulated over drained intervals
#[derive(Debug, Default)]
pub struct FlowTotals {
    packets: BTreeMap<FlowKey, i64>,
}

impl FlowTotals {
    pub fn add(&mut self, records: &[FlowRecord]) {
        for record in records {
            let total = self.packets.entry(FlowKey(record.key)).or_default();
            *total = total.saturating_add(record.packets);
        }
    }

    /// Accumulated flows, busiest first
    pub fn records(&self) -> Vec<FlowRecord> {
        let mut records = self
            .packets
            .iter()
            .map(|(key, packets)| FlowRecord::new(*key, *packets))
            .collect::<Vec<_>>();
        sort_records(&mut records);
        records
    }
}

pub fn sort_records(records: &mut [FlowRecord]) {
    records.sort_by(|a, b| b.packets.cmp(&a.packets).then(a.key.cmp(&b.key)));
}

pub fn total_packets(records: &[FlowRecord]) -> i128 {
    records.iter().map(|r| r.packets as i128).sum()
}

/// Reads the per-CPU receive counter of the redirector
pub struct RxStats {
    rx_count: PerCpuArray<MapData, i64>,
    last: Option<(i128, Instant)>,
}

impl RxStats {
    pub fn new(rx_count: PerCpuArray<MapData, i64>) -> Self {
        Self {
            rx_count,
            last: None,
        }
    }

    /// Counter value of every possible CPU
    pub fn per_cpu(&self) -> Result<Vec<i64>, MapError> {
        let values = self.rx_count.get(&RX_COUNT_INDEX, 0)?;
        Ok(values.iter().copied().collect())
    }

    /// Packets per second since the previous call
    pub fn rates(&mut self, per_cpu: &[i64]) -> StatsRates {
        let total = sum_per_cpu(per_cpu);
        let now = Instant::now();
        let rates = match self.last {
            Some((last_total, last_time)) => {
                StatsRates::between(last_total, total, now.duration_since(last_time))
            }
            None => StatsRates::default(),
        };
        self.last = Some((total, now));
        rates
    }
}

pub fn sum_per_cpu(values: &[i64]) -> i128 {
    values.iter().map(|v| *v as i128).sum()
}

/// Statistics rates structure
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsRates {
    pub packets_per_sec: f64,
    pub time_period: f64,
}

impl StatsRates {
    pub fn between(previous: i128, current: i128, elapsed: Duration) -> Self {
        let time_period = elapsed.as_secs_f64();
        if time_period <= 0.0 {
            return Self::default();
        }
        Self {
            packets_per_sec: (current - previous) as f64 / time_period,
            time_period,
        }
    }

    /// Format rates as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Packets/sec: {:.2} (over {:.2}s)",
            self.packets_per_sec, self.time_period
        )
    }
}

pub fn flows_json(iface: &str, records: &[FlowRecord]) -> serde_json::Value {
    serde_json::json!({
        "iface": iface,
        "flows": records,
        "total_packets": total_packets(records).to_string(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

pub fn rx_json(iface: &str, target_cpu: Option<u32>, per_cpu: &[i64]) -> serde_json::Value {
    serde_json::json!({
        "iface": iface,
        "target_cpu": target_cpu,
        "rx_per_cpu": per_cpu,
        "rx_total": sum_per_cpu(per_cpu).to_string(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

pub fn display_flows(records: &[FlowRecord]) {
    println!("╭──────────────────┬──────────────────┬──────────────────────╮");
    println!("│ Source           │ Destination      │              Packets │");
    println!("├──────────────────┼──────────────────┼──────────────────────┤");
    for record in records {
        println!(
            "│ {:<16} │ {:<16} │ {:>20} │",
            record.source.to_string(),
            record.destination.to_string(),
            record.packets
        );
    }
    println!("╰──────────────────┴──────────────────┴──────────────────────╯");
    println!("{} flows, {} packets", records.len(), total_packets(records));
}

pub fn display_rx(per_cpu: &[i64], rates: &StatsRates) {
    let busy = per_cpu
        .iter()
        .enumerate()
        .filter(|(_, count)| **count != 0)
        .map(|(cpu, count)| format!("cpu{cpu}={count}"))
        .collect::<Vec<_>>();
    if busy.is_empty() {
        println!("RX: no frames redirected yet");
    } else {
        println!("RX: {} (total {})", busy.join(" "), sum_per_cpu(per_cpu));
    }
    println!("Rates: {}", rates.format());
}

/// Call `on_tick` every `period` until `shutdown` resolves. The first tick
/// fires immediately. Returns the number of ticks, or the error the shutdown
/// future resolved with.
pub async fn report_until<S, E, F>(period: Duration, shutdown: S, mut on_tick: F) -> Result<u64, E>
where
    S: Future<Output = Result<(), E>>,
    F: FnMut(),
{
    let mut interval = tokio::time::interval(period);
    let mut shutdown = Box::pin(shutdown);
    let mut ticks = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                on_tick();
                ticks += 1;
            }
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }

    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(saddr: [u8; 4], daddr: [u8; 4], packets: i64) -> FlowRecord {
        FlowRecord::new(
            FlowKey::new(u32::from(Ipv4Addr::from(saddr)), u32::from(Ipv4Addr::from(daddr))),
            packets,
        )
    }

    #[test]
    fn test_flow_record_from_key() {
        let r = FlowRecord::new(FlowKey(0x0A00_0001_0A00_0002), 7);
        assert_eq!(r.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(r.destination, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(r.packets, 7);
    }

    #[test]
    fn test_sort_records_busiest_first() {
        let mut records = vec![
            record([10, 0, 0, 3], [10, 0, 0, 4], 1),
            record([10, 0, 0, 1], [10, 0, 0, 2], 40),
            record([10, 0, 0, 2], [10, 0, 0, 1], 40),
            record([10, 0, 0, 9], [10, 0, 0, 9], 5),
        ];
        sort_records(&mut records);

        let packets: Vec<i64> = records.iter().map(|r| r.packets).collect();
        assert_eq!(packets, vec![40, 40, 5, 1]);
        // Ties ordered by key
        assert_eq!(records[0].source, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_totals_do_not_overflow() {
        let records = vec![
            record([10, 0, 0, 1], [10, 0, 0, 2], i64::MAX),
            record([10, 0, 0, 3], [10, 0, 0, 4], 1),
        ];
        assert_eq!(total_packets(&records), i64::MAX as i128 + 1);
        assert_eq!(sum_per_cpu(&[i64::MAX, i64::MAX]), 2 * i64::MAX as i128);
        assert_eq!(sum_per_cpu(&[]), 0);
    }

    #[test]
    fn test_rates_between() {
        let rates = StatsRates::between(100, 600, Duration::from_secs(5));
        assert_eq!(rates.packets_per_sec, 100.0);
        assert_eq!(rates.time_period, 5.0);

        assert_eq!(StatsRates::between(5, 10, Duration::ZERO), StatsRates::default());
        assert_eq!(
            StatsRates::between(0, 250, Duration::from_millis(500)).format(),
            "Packets/sec: 500.00 (over 0.50s)"
        );
    }

    #[test]
    fn test_flows_json() {
        let records = vec![record([10, 0, 0, 1], [10, 0, 0, 2], 2)];
        let json = flows_json("eth0", &records);

        assert_eq!(json["iface"], "eth0");
        assert_eq!(json["flows"][0]["source"], "10.0.0.1");
        assert_eq!(json["flows"][0]["destination"], "10.0.0.2");
        assert_eq!(json["flows"][0]["packets"], 2);
        assert_eq!(json["flows"][0]["key"], 0x0A00_0001_0A00_0002u64);
        assert_eq!(json["total_packets"], "2");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_rx_json() {
        let json = rx_json("eth1", Some(3), &[4, 0, 6, 0]);
        assert_eq!(json["target_cpu"], 3);
        assert_eq!(json["rx_per_cpu"][2], 6);
        assert_eq!(json["rx_total"], "10");

        let json = rx_json("eth1", None, &[]);
        assert!(json["target_cpu"].is_null());
    }

    #[test]
    fn test_drain_reports_value_read_before_delete() {
        // Kernel table: A busy, B quiet, C deleted by someone else before we get to it
        let a = FlowKey::new(0x0A00_0001, 0x0A00_0002);
        let b = FlowKey::new(0x0A00_0003, 0x0A00_0004);
        let c = FlowKey::new(0x0A00_0005, 0x0A00_0006);
        let mut table: std::collections::HashMap<FlowKey, i64> =
            [(a, 10), (b, 3)].into_iter().collect();
        let mut totals = FlowTotals::default();

        // Three packets for A arrive after the key list was taken but before
        // A itself is read: they are part of what is reported.
        *table.get_mut(&a).unwrap() += 3;
        let first = take_each([a, b, c], |key| Ok(table.remove(key))).unwrap();
        assert_eq!(first.iter().map(|r| r.packets).collect::<Vec<_>>(), vec![13, 3]);
        assert!(table.is_empty());
        totals.add(&first);

        // A is re-created by the next packets and drained again
        table.insert(a, 4);
        let second = take_each([a], |key| Ok(table.remove(key))).unwrap();
        totals.add(&second);

        let records = totals.records();
        assert_eq!(records.len(), 2);
        assert_eq!((FlowKey(records[0].key), records[0].packets), (a, 17));
        assert_eq!((FlowKey(records[1].key), records[1].packets), (b, 3));
        assert_eq!(total_packets(&records), 20);
    }

    #[test]
    fn test_take_each_propagates_map_errors() {
        let key = FlowKey::new(1, 2);
        let result = take_each([key], |_| Err(MapError::KeyNotFound));
        assert!(matches!(result, Err(MapError::KeyNotFound)));
    }

    #[test]
    fn test_flow_totals_saturate() {
        let mut totals = FlowTotals::default();
        let key = FlowKey::new(1, 2);
        totals.add(&[FlowRecord::new(key, i64::MAX)]);
        totals.add(&[FlowRecord::new(key, 5)]);
        assert_eq!(totals.records()[0].packets, i64::MAX);
    }

    #[tokio::test]
    async fn test_report_until_ticks_then_stops() {
        let mut seen = 0;
        let ticks = report_until(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_millis(55)).await;
                Ok::<(), std::io::Error>(())
            },
            || seen += 1,
        )
        .await
        .unwrap();

        assert!(ticks >= 1);
        assert_eq!(ticks, seen);
    }

    #[tokio::test]
    async fn test_report_until_immediate_shutdown() {
        let ticks = report_until(Duration::from_secs(3600), async { Ok::<(), std::io::Error>(()) }, || {})
            .await
            .unwrap();
        // Either branch may win the first poll, but the long period stops a second tick
        assert!(ticks <= 1);
    }

    #[tokio::test]
    async fn test_report_until_returns_shutdown_error() {
        let result = report_until(
            Duration::from_secs(3600),
            async { Err(std::io::Error::other("no signal handler")) },
            || {},
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "no signal handler");
    }
}
