use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};
use wom_common::{Device, Remote, RemoteAction, ScheduleCursor, WorkerConfig};

use crate::{channel::Channel, monitor::MonitorHandle, power::PowerSwitch, server::SharedDirectory};

/// Outcome of a remote wake/shutdown command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Sent,
    Stale,
    UnknownDevice,
}

/// Time-driven and remote wake/shutdown. Both loops borrow the worker, so
/// callers share it behind an `Arc`.
pub struct Worker<S> {
    config: WorkerConfig,
    timezone: Tz,
    switch: S,
    directory: SharedDirectory,
    monitor: MonitorHandle,
}

impl<S: PowerSwitch> Worker<S> {
    pub fn new(
        config: WorkerConfig,
        timezone: Tz,
        switch: S,
        directory: SharedDirectory,
        monitor: MonitorHandle,
    ) -> Self {
        Self {
            config,
            timezone,
            switch,
            directory,
            monitor,
        }
    }

    pub fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.timezone).naive_local()
    }

    pub async fn run_schedule(&self) {
        let tick = self.config.tick_secs.max(1);
        let mut cursor = ScheduleCursor::new(self.local_now());
        info!(tick, timezone = %self.timezone, "scheduler started");

        loop {
            let timestamp = Utc::now().timestamp().rem_euclid(tick as i64) as u64;
            tokio::time::sleep(Duration::from_secs((tick - timestamp).max(1))).await;

            let now = self.local_now();
            let (time_prev, time_now) = cursor.advance(now);
            self.evaluate(now.date(), time_prev, time_now).await;
        }
    }

    /// Checks every device's rules for the window `[time_prev, time_now]`
    /// and fires the actions whose boundary was crossed.
    pub async fn evaluate(
        &self,
        date: NaiveDate,
        time_prev: u16,
        time_now: u16,
    ) -> Vec<(String, RemoteAction)> {
        let (day, devices) = {
            let directory = self.directory.read().await;
            (directory.day_type(date), directory.snapshot())
        };
        let day_label = day.map_or("unlisted", |day| day.as_str());

        let mut fired = Vec::new();
        for (name, device) in devices {
            let up = self.monitor.is_up(&name);

            if !up && device.schedule.check_startup(day, time_prev, time_now) {
                info!(device = %name, day = day_label, "scheduled wakeup");
                self.burst(&device, RemoteAction::Wakeup).await;
                fired.push((name, RemoteAction::Wakeup));
                continue;
            }

            if up && device.schedule.check_shutdown(day, time_prev, time_now) {
                info!(device = %name, day = day_label, "scheduled shutdown");
                self.burst(&device, RemoteAction::Shutdown).await;
                fired.push((name, RemoteAction::Shutdown));
                continue;
            }

            if device.has_schedule() {
                debug!(device = %name, day = day_label, time_prev, time_now, "schedule idle");
            }
        }

        if !fired.is_empty() {
            self.monitor.raise_activity();
        }
        fired
    }

    pub async fn run_remote(&self, commands: Channel<Remote>) {
        loop {
            let remote = commands.recv().await;
            self.handle_remote(remote, Utc::now().timestamp()).await;
        }
    }

    pub async fn handle_remote(&self, remote: Remote, now: i64) -> RemoteOutcome {
        let Remote { action, command } = remote;
        if (now - command.time).abs() > self.config.offset_secs {
            debug!(
                device = %command.name,
                skew = now - command.time,
                "stale {} command ignored",
                action.as_str()
            );
            return RemoteOutcome::Stale;
        }

        let Some(device) = self.directory.read().await.device(&command.name) else {
            error!(device = %command.name, "{} for unknown device", action.as_str());
            return RemoteOutcome::UnknownDevice;
        };

        info!(device = %command.name, "remote {}", action.as_str());
        self.send(&device, action).await;
        self.monitor.raise_activity();
        RemoteOutcome::Sent
    }

    /// Wake-on-LAN and the shutdown datagram are unacknowledged, so the
    /// scheduled path repeats them.
    async fn burst(&self, device: &Device, action: RemoteAction) {
        let interval = Duration::from_millis(self.config.action_interval_ms);
        for attempt in 0..self.config.action_repeat {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            self.send(device, action).await;
        }
    }

    async fn send(&self, device: &Device, action: RemoteAction) {
        let result = match action {
            RemoteAction::Wakeup => self.switch.wake(device).await,
            RemoteAction::Shutdown => self.switch.shutdown(device).await,
        };
        if let Err(err) = result {
            warn!(device = %device.name, "{} send failed: {err}", action.as_str());
        }
    }
}
