//  HEARTBEAT.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 16:44:21
//  Last edited:
//    01 Aug 2024, 10:12:05
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the heart-beat watcher: a background task that
//!   periodically pings every registered worker and gives up on workers
//!   that miss too many pongs in a row. The table of missed pongs is
//!   keyed by worker address and shared with the worker-facing gRPC
//!   frontend: a worker may answer a probe directly, or out-of-band with
//!   a `Pong` call on its own connection. Either resets its counter.
//

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::context::WorkerContext;
use crate::registry::WorkerRegistry;
use crate::spec::{HeartbeatConfig, WorkerStatus};


/***** LIBRARY *****/
/// Periodically probes every registered worker for liveness.
///
/// A worker that misses `max_ping_times` probes in a row is reported not-alive, upon which the registry takes it out of rotation. The probe
/// interval is `max_time_out / max_ping_times`, so a completely silent worker is given up on after roughly `max_time_out`.
pub struct Watcher {
    /// The registry whose workers we watch.
    registry: Arc<WorkerRegistry>,
    /// The timing knobs.
    config:   HeartbeatConfig,
    /// Consecutive missed pongs, keyed by worker address. Written by the watch loop, reset by [`Watcher::recv_pong()`].
    timeouts: Mutex<HashMap<String, u32>>,
}

impl Watcher {
    /// Constructor for the Watcher.
    ///
    /// # Arguments
    /// - `registry`: The registry whose workers to watch.
    /// - `config`: The timing knobs to watch them with.
    ///
    /// # Returns
    /// A new Watcher instance, wrapped in an [`Arc`] so the watch loop and the worker-facing frontend can share its table. Nothing happens
    /// until [`Watcher::spawn()`] is called.
    #[inline]
    pub fn new(registry: Arc<WorkerRegistry>, config: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self { registry, config, timeouts: Mutex::new(HashMap::new()) })
    }

    /// Spawns the watch loop on the current runtime.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting heart-beat watcher (interval {:?}, {} missed pongs give up, per-ping deadline {:?})",
            self.config.max_time_out / self.config.max_ping_times,
            self.config.max_ping_times,
            self.config.ping_deadline
        );
        tokio::spawn(self.run())
    }

    /// The watch loop itself.
    async fn run(self: Arc<Self>) {
        let mut ticker: Interval = interval(self.config.max_time_out / self.config.max_ping_times);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let workers: Vec<Arc<WorkerContext>> = self.registry.worker_snapshot();
            {
                let mut timeouts: MutexGuard<HashMap<String, u32>> = self.timeouts.lock().unwrap();
                timeouts.retain(|address, _| workers.iter().any(|w| &w.address().to_string() == address));
            }
            for worker in workers {
                if worker.status() != WorkerStatus::Ready {
                    continue;
                }
                let address: String = worker.address().to_string();

                // Fire the probe. A direct answer counts as a pong; so does a `Pong` call coming in on the worker's own connection in the
                // meantime (see `recv_pong()`).
                let ponged: bool = match worker.ping(self.config.ping_deadline).await {
                    Ok(_) => true,
                    Err(err) => {
                        debug!("Ping to '{address}' got no answer: {err}");
                        false
                    },
                };

                let missed: u32 = {
                    let mut timeouts: MutexGuard<HashMap<String, u32>> = self.timeouts.lock().unwrap();
                    let missed: &mut u32 = timeouts.entry(address.clone()).or_insert(0);
                    if ponged {
                        *missed = 0;
                    } else {
                        *missed += 1;
                    }
                    *missed
                };
                if missed >= self.config.max_ping_times {
                    warn!("Recv pong time out from '{address}'");
                    worker.notify_not_alive();
                    self.timeouts.lock().unwrap().remove(&address);
                } else if missed > 0 {
                    debug!("Missed pong {missed}/{} from '{address}'", self.config.max_ping_times);
                }
            }
        }
    }

    /// Resets the missed-pong counter of the given peer. Called by the worker-facing frontend when a worker answers a probe out-of-band.
    ///
    /// # Arguments
    /// - `address`: The address of the answering peer, as it announced itself at registration.
    pub fn recv_pong(&self, address: &str) {
        let mut timeouts: MutexGuard<HashMap<String, u32>> = self.timeouts.lock().unwrap();
        match timeouts.get_mut(address) {
            Some(missed) => {
                *missed = 0;
            },
            None => debug!("Recv pong after timeout or stop from '{address}'"),
        }
    }

    /// Returns the current missed-pong counter of the given peer, or [`None`] if the watch loop is not (or no longer) tracking it.
    #[inline]
    pub fn missed_pongs(&self, address: &str) -> Option<u32> { self.timeouts.lock().unwrap().get(address).copied() }
}



#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use specifications::address::Address;
    use specifications::serving::{PredictReply, PredictRequest};
    use specifications::working::{MethodInfo, ServableRegSpec};
    use tonic::Status;

    use super::*;
    use crate::notify::NotifyWorker;

    /// A stub whose pings either always land or always get lost.
    struct PingNotify {
        answers: bool,
    }
    #[async_trait]
    impl NotifyWorker for PingNotify {
        async fn predict(&self, request: PredictRequest) -> Result<PredictReply, Status> {
            Ok(PredictReply { spec: request.spec, instances: request.instances, error_msg: vec![] })
        }

        async fn exit(&self) -> Result<(), Status> { Ok(()) }

        async fn ping(&self, _deadline: Duration) -> Result<(), Status> {
            if self.answers { Ok(()) } else { Err(Status::deadline_exceeded("Ping timed out")) }
        }
    }

    fn register_worker(registry: &WorkerRegistry, pid: u64, answers: bool) {
        let spec: ServableRegSpec = ServableRegSpec {
            servable_name: "test_servable".into(),
            version_number: 1,
            batch_size: 1,
            methods: vec![MethodInfo { name: "add_common".into(), input_names: vec!["x1".into(), "x2".into()] }],
            own_device: true,
        };
        let ctx = Arc::new(WorkerContext::new(pid, Address::hostname("worker", 6000 + pid as u16), spec, registry.events()));
        ctx.on_register(Arc::new(PingNotify { answers }));
        registry.register_context(ctx).unwrap();
    }

    #[tokio::test]
    async fn silent_workers_are_given_up_on() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        register_worker(&registry, 1, true);
        register_worker(&registry, 2, false);

        let config: HeartbeatConfig =
            HeartbeatConfig { max_time_out: Duration::from_millis(50), max_ping_times: 5, ping_deadline: Duration::from_millis(1) };
        let handle: JoinHandle<()> = Watcher::new(registry.clone(), config).spawn();

        // Worker 2 misses 5 pongs in ~50ms and is dropped; worker 1 stays
        tokio::time::sleep(Duration::from_millis(300)).await;
        let workers: Vec<Arc<WorkerContext>> = registry.worker_snapshot();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].pid(), 1);
        assert_eq!(workers[0].status(), WorkerStatus::Ready);
        handle.abort();
    }

    #[tokio::test]
    async fn pongs_reset_the_missed_count() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        let watcher: Arc<Watcher> = Watcher::new(registry, HeartbeatConfig::default());

        // Seed the table the way the watch loop would after a few silent probes
        watcher.timeouts.lock().unwrap().insert("worker:6001".into(), 7);
        watcher.recv_pong("worker:6001");
        assert_eq!(watcher.missed_pongs("worker:6001"), Some(0));

        // Pongs from peers we are not (or no longer) watching are ignored
        watcher.recv_pong("worker:9999");
        assert_eq!(watcher.missed_pongs("worker:9999"), None);
    }

    #[tokio::test]
    async fn out_of_band_pongs_keep_a_worker_alive() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        register_worker(&registry, 1, false);

        let config: HeartbeatConfig =
            HeartbeatConfig { max_time_out: Duration::from_millis(100), max_ping_times: 10, ping_deadline: Duration::from_millis(1) };
        let watcher: Arc<Watcher> = Watcher::new(registry.clone(), config);
        let handle: JoinHandle<()> = watcher.clone().spawn();

        // The worker never answers probes directly, but keeps ponging on its own connection
        let ponger: Arc<Watcher> = watcher.clone();
        let pong_handle: JoinHandle<()> = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ponger.recv_pong("worker:6001");
            }
        });

        // Well past max_time_out, the worker is still in rotation
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(registry.worker_snapshot().len(), 1);
        handle.abort();
        pong_handle.abort();
    }
}
