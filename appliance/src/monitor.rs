use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info};
use wom_common::{MonitorConfig, Outbound};

use crate::{channel::Channel, icmp::Prober, server::SharedDirectory};

/// Read side of the monitor shared with the scheduler.
#[derive(Clone, Default)]
pub struct MonitorHandle {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    status: Mutex<BTreeMap<String, bool>>,
    activity: Notify,
}

impl MonitorHandle {
    /// Devices not yet covered by a finished sweep read as down.
    pub fn is_up(&self, name: &str) -> bool {
        self.lock_status().get(name).copied().unwrap_or(false)
    }

    pub fn statuses(&self) -> BTreeMap<String, bool> {
        self.lock_status().clone()
    }

    /// Switches the monitor to its quick tick for the next few sweeps. The
    /// signal is kept until the monitor next waits on it.
    pub fn raise_activity(&self) {
        self.shared.activity.notify_one();
    }

    pub(crate) async fn activity(&self) {
        self.shared.activity.notified().await;
    }

    pub(crate) fn publish(&self, status: BTreeMap<String, bool>) {
        *self.lock_status() = status;
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, bool>> {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceHealth {
    pub failure_streak: u32,
    pub last_probe_error: bool,
}

pub struct Monitor<P> {
    config: MonitorConfig,
    prober: P,
    directory: SharedDirectory,
    outbound: Channel<Outbound>,
    handle: MonitorHandle,
    synced_version: Option<u32>,
    health: HashMap<String, DeviceHealth>,
    quick_remaining: u32,
}

impl<P: Prober> Monitor<P> {
    pub fn new(
        config: MonitorConfig,
        prober: P,
        directory: SharedDirectory,
        outbound: Channel<Outbound>,
        handle: MonitorHandle,
    ) -> Self {
        Self {
            config,
            prober,
            directory,
            outbound,
            handle,
            synced_version: None,
            health: HashMap::new(),
            quick_remaining: 0,
        }
    }

    #[cfg(test)]
    pub fn health(&self, name: &str) -> Option<DeviceHealth> {
        self.health.get(name).copied()
    }

    pub async fn run(mut self) {
        info!(
            idle_tick = self.config.idle_tick_secs,
            quick_tick = self.config.busy_tick_secs,
            "monitor started"
        );

        let handle = self.handle.clone();
        loop {
            let begin = Instant::now();
            self.quick_remaining = self.quick_remaining.saturating_sub(1);

            self.sweep().await;

            loop {
                let deadline = begin + self.tick();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = handle.activity() => {
                        debug!("monitor activity raised");
                        self.quick_remaining = self.config.busy_count;
                    }
                }
            }
        }
    }

    fn tick(&self) -> Duration {
        let secs = if self.quick_remaining > 0 {
            self.config.busy_tick_secs
        } else {
            self.config.idle_tick_secs
        };
        Duration::from_secs(secs)
    }

    /// Probes every device once, in order, then publishes and reports the
    /// resulting up/down map.
    pub async fn sweep(&mut self) -> BTreeMap<String, bool> {
        let (version, devices) = {
            let directory = self.directory.read().await;
            (directory.version(), directory.snapshot())
        };
        self.sync(version, devices.iter().map(|(name, _)| name.as_str()));

        let mut status = BTreeMap::new();
        for (name, device) in devices {
            let outcome = self.prober.probe(device.ip).await;
            let health = self.health.entry(name.clone()).or_default();
            match outcome {
                Ok(true) => {
                    health.failure_streak = 0;
                    health.last_probe_error = false;
                }
                Ok(false) => {
                    health.failure_streak = (health.failure_streak + 1).min(self.config.retry_times);
                    health.last_probe_error = false;
                }
                Err(err) => {
                    debug!(device = %name, ip = %device.ip, "probe failed: {err}");
                    health.failure_streak = (health.failure_streak + 1).min(self.config.retry_times);
                    health.last_probe_error = true;
                }
            }
            status.insert(name, health.failure_streak < self.config.retry_times);
        }

        debug!(?status, "monitor sweep finished");
        self.handle.publish(status.clone());
        self.outbound.send(Outbound::Report(status.clone()));
        status
    }

    /// Rebuilds the health map after a directory change: counters survive
    /// for devices that remain, removed devices are dropped, new ones start
    /// at zero.
    fn sync<'a>(&mut self, version: u32, names: impl Iterator<Item = &'a str>) {
        if self.synced_version == Some(version) {
            return;
        }

        let mut health = HashMap::new();
        for name in names {
            let kept = self.health.remove(name).unwrap_or_default();
            health.insert(name.to_string(), kept);
        }
        debug!(version, devices = health.len(), "monitor resynced");
        self.health = health;
        self.synced_version = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        net::Ipv4Addr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;
    use tokio::sync::RwLock;
    use wom_common::DeviceDirectory;

    use super::*;

    #[derive(Default)]
    struct ScriptedProber {
        replies: Mutex<HashMap<Ipv4Addr, VecDeque<io::Result<bool>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProber {
        fn script(&self, ip: Ipv4Addr, replies: Vec<io::Result<bool>>) {
            self.replies.lock().unwrap().insert(ip, replies.into());
        }
    }

    impl Prober for Arc<ScriptedProber> {
        async fn probe(&self, ip: Ipv4Addr) -> io::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .get_mut(&ip)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(true))
        }
    }

    fn directory(devices: &[(&str, &str)]) -> SharedDirectory {
        let mut directory = DeviceDirectory::default();
        apply(&mut directory, devices);
        Arc::new(RwLock::new(directory))
    }

    fn apply(directory: &mut DeviceDirectory, devices: &[(&str, &str)]) {
        let devices: serde_json::Map<_, _> = devices
            .iter()
            .map(|(name, ip)| {
                (
                    name.to_string(),
                    json!({"name": name, "ip": ip, "mac": "AA:BB:CC:DD:EE:FF"}),
                )
            })
            .collect();
        directory
            .apply_json(&json!({"devices": devices, "days": []}))
            .unwrap();
    }

    fn monitor(
        prober: Arc<ScriptedProber>,
        directory: SharedDirectory,
    ) -> (Monitor<Arc<ScriptedProber>>, Channel<Outbound>, MonitorHandle) {
        let outbound = Channel::new(8);
        let handle = MonitorHandle::default();
        let monitor = Monitor::new(
            MonitorConfig::default(),
            prober,
            directory,
            outbound.clone(),
            handle.clone(),
        );
        (monitor, outbound, handle)
    }

    #[tokio::test]
    async fn device_flips_down_only_after_retry_times_misses() {
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        let prober = Arc::new(ScriptedProber::default());
        prober.script(
            ip,
            vec![
                Ok(false),
                Err(io::ErrorKind::TimedOut.into()),
                Ok(false),
                Ok(false),
                Ok(true),
            ],
        );
        let (mut monitor, outbound, handle) = monitor(prober, directory(&[("A", "10.0.0.5")]));

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(monitor.sweep().await["A"]);
        }
        assert_eq!(seen, [true, true, false, false, true]);
        assert!(handle.is_up("A"));
        assert_eq!(outbound.len(), 5);
        assert_eq!(
            outbound.try_recv(),
            Some(Outbound::Report(BTreeMap::from([("A".to_string(), true)])))
        );
    }

    #[tokio::test]
    async fn streak_is_capped_and_flagged_on_errors() {
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        let prober = Arc::new(ScriptedProber::default());
        prober.script(ip, (0..5).map(|_| Err(io::ErrorKind::Other.into())).collect());
        let (mut monitor, _outbound, _handle) = monitor(prober, directory(&[("A", "10.0.0.5")]));

        for _ in 0..5 {
            monitor.sweep().await;
        }
        assert_eq!(
            monitor.health("A"),
            Some(DeviceHealth {
                failure_streak: 3,
                last_probe_error: true,
            })
        );
    }

    #[tokio::test]
    async fn resync_keeps_surviving_counters() {
        let prober = Arc::new(ScriptedProber::default());
        prober.script(Ipv4Addr::new(10, 0, 0, 5), vec![Ok(false), Ok(false)]);
        let shared = directory(&[("A", "10.0.0.5"), ("B", "10.0.0.6")]);
        let (mut monitor, _outbound, _handle) = monitor(prober, Arc::clone(&shared));

        monitor.sweep().await;
        apply(
            &mut *shared.write().await,
            &[("A", "10.0.0.5"), ("C", "10.0.0.7")],
        );
        let status = monitor.sweep().await;

        assert_eq!(monitor.health("A").map(|h| h.failure_streak), Some(2));
        assert_eq!(monitor.health("B"), None);
        assert_eq!(monitor.health("C").map(|h| h.failure_streak), Some(0));
        assert_eq!(status.keys().collect::<Vec<_>>(), ["A", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_switches_to_quick_tick() {
        let prober = Arc::new(ScriptedProber::default());
        let (monitor, _outbound, handle) =
            monitor(Arc::clone(&prober), directory(&[("A", "10.0.0.5")]));
        tokio::spawn(monitor.run());

        let sweeps = || prober.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sweeps(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sweeps(), 2);

        handle.raise_activity();
        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(sweeps(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sweeps(), 3);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sweeps(), 4);
    }
}
