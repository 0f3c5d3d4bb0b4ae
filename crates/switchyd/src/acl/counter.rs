//! Background ACL counter collection.
//!
//! The collector walks every rule's counter row on a fixed interval,
//! reads (packets, bytes) from the driver and writes the `COUNTERS`
//! table. The row map is the shared state between the control thread
//! and this sampler; both sides take the single hub mutex. Overrunning
//! a cycle logs a warning and skips the sleep.

use crate::tables::COUNTERS_TABLE;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use switchyd_orch_common::Store;
use switchyd_sad::{AclCounterOid, SwitchDriver};

pub const COUNTERS_READ_INTERVAL: Duration = Duration::from_secs(10);

/// Counter state of one rule. `counter` is absent while the rule is
/// staged (mirror session inactive); the carry fields accumulate
/// counts over deactivations.
#[derive(Debug, Clone, Default)]
pub struct CounterRow {
    pub counter: Option<AclCounterOid>,
    pub carry_packets: u64,
    pub carry_bytes: u64,
}

pub struct CounterState {
    pub rows: BTreeMap<String, CounterRow>,
    stop: bool,
}

/// The shared mutex + condvar between the control thread and the
/// collector.
pub struct CounterHub {
    state: Mutex<CounterState>,
    wake: Condvar,
}

impl CounterHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState {
                rows: BTreeMap::new(),
                stop: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.state.lock().expect("counter hub mutex poisoned")
    }
}

impl Default for CounterHub {
    fn default() -> Self {
        Self::new()
    }
}

/// The sampler thread handle.
pub struct CounterCollector {
    hub: Arc<CounterHub>,
    handle: Option<JoinHandle<()>>,
}

impl CounterCollector {
    pub fn spawn(
        hub: Arc<CounterHub>,
        driver: Arc<dyn SwitchDriver>,
        store: Store,
        interval: Duration,
    ) -> Self {
        let thread_hub = Arc::clone(&hub);
        let handle = std::thread::Builder::new()
            .name("acl-counters".to_string())
            .spawn(move || collect_loop(thread_hub, driver, store, interval))
            .expect("failed to spawn counter collector");
        Self {
            hub,
            handle: Some(handle),
        }
    }

    /// Signals the sampler and joins it.
    pub fn stop(&mut self) {
        {
            let mut state = self.hub.lock();
            state.stop = true;
        }
        self.hub.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CounterCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn collect_loop(
    hub: Arc<CounterHub>,
    driver: Arc<dyn SwitchDriver>,
    store: Store,
    interval: Duration,
) {
    let mut guard = hub.lock();
    loop {
        if guard.stop {
            break;
        }

        let started = Instant::now();
        for (key, row) in &guard.rows {
            let (packets, bytes) = match row.counter {
                Some(counter) => driver.read_acl_counter(counter).unwrap_or_else(|e| {
                    warn!("failed to read counter for rule {}: {}", key, e);
                    (0, 0)
                }),
                None => (0, 0),
            };
            store.set(
                COUNTERS_TABLE,
                key,
                vec![
                    (
                        "Packets".to_string(),
                        (row.carry_packets + packets).to_string(),
                    ),
                    ("Bytes".to_string(), (row.carry_bytes + bytes).to_string()),
                ],
            );
        }

        let elapsed = started.elapsed();
        if elapsed >= interval {
            warn!(
                "ACL counter update took {:?}, longer than the {:?} interval",
                elapsed, interval
            );
            continue;
        }

        debug!("ACL counter collector sleeping {:?}", interval - elapsed);
        let (next, _timeout) = hub
            .wake
            .wait_timeout(guard, interval - elapsed)
            .expect("counter hub mutex poisoned");
        guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyd_sad::{AclTableSpec, SimConfig, SimDriver};

    #[test]
    fn test_collector_writes_rows() {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let table = driver
            .create_acl_table(&AclTableSpec {
                fields: vec![],
                range_kinds: vec![],
            })
            .unwrap();
        let counter = driver.create_acl_counter(table).unwrap();
        driver.set_acl_counter(counter, 42, 4200);

        let store = Store::new();
        let hub = Arc::new(CounterHub::new());
        hub.lock().rows.insert(
            "tbl:rule0".to_string(),
            CounterRow {
                counter: Some(counter),
                carry_packets: 8,
                carry_bytes: 800,
            },
        );

        let mut collector = CounterCollector::spawn(
            Arc::clone(&hub),
            driver.clone(),
            store.clone(),
            Duration::from_millis(20),
        );

        // Two cycles are enough for at least one write.
        std::thread::sleep(Duration::from_millis(60));
        collector.stop();

        assert_eq!(
            store.get_field(COUNTERS_TABLE, "tbl:rule0", "Packets").as_deref(),
            Some("50")
        );
        assert_eq!(
            store.get_field(COUNTERS_TABLE, "tbl:rule0", "Bytes").as_deref(),
            Some("5000")
        );
    }

    #[test]
    fn test_staged_rows_report_carry_only() {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let store = Store::new();
        let hub = Arc::new(CounterHub::new());
        hub.lock().rows.insert(
            "tbl:staged".to_string(),
            CounterRow {
                counter: None,
                carry_packets: 5,
                carry_bytes: 500,
            },
        );

        let mut collector = CounterCollector::spawn(
            Arc::clone(&hub),
            driver,
            store.clone(),
            Duration::from_millis(20),
        );
        std::thread::sleep(Duration::from_millis(60));
        collector.stop();

        assert_eq!(
            store.get_field(COUNTERS_TABLE, "tbl:staged", "Packets").as_deref(),
            Some("5")
        );
    }
}
