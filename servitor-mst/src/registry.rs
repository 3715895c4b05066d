//  REGISTRY.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 15:21:36
//  Last edited:
//    31 Jul 2024, 15:02:29
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the WorkerRegistry, which handles worker registration
//!   and lifecycle notifications and wires workers into the appropriate
//!   ServableEndpoint. Worker-side failures discovered mid-dispatch come
//!   in over an event channel, pumped on a background task.
//

use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};
use specifications::address::Address;
use specifications::working::{GetModelInfoReply, WorkerRegSpec};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::context::WorkerContext;
use crate::endpoint::ServableEndpoint;
use crate::errors::RegistryError;
use crate::notify::GrpcNotifyWorker;
use crate::spec::WorkerEvent;


/***** HELPER STRUCTS *****/
/// The state of a [`WorkerRegistry`].
struct RegistryState {
    /// The endpoints, one per registered (servable, version) pair.
    endpoints: Vec<Arc<ServableEndpoint>>,
    /// All known workers, by pid.
    workers_by_pid:  HashMap<u64, Arc<WorkerContext>>,
    /// The pid belonging to every registered worker address.
    pids_by_address: HashMap<String, u64>,
}





/***** LIBRARY *****/
/// Handles worker registration, unregistration and lifecycle notifications.
///
/// The registry owns the [`WorkerContext`]s; endpoints and method schedulers only hold handles keyed by pid. Constructing a registry spawns its
/// event pump, so it must happen on a Tokio runtime.
pub struct WorkerRegistry {
    /// The initial credit handed to every worker of every method.
    round:  i64,
    /// The mutable state.
    state:  Mutex<RegistryState>,
    /// The sender handed to every WorkerContext for reporting lifecycle events.
    events: UnboundedSender<WorkerEvent>,
}

impl WorkerRegistry {
    /// Constructor for the WorkerRegistry that also spawns its event pump.
    ///
    /// # Arguments
    /// - `round`: The initial credit handed to every worker of every method.
    ///
    /// # Returns
    /// A new WorkerRegistry instance, wrapped in an [`Arc`] so the event pump can hold a weak reference to it.
    pub fn new(round: i64) -> Arc<Self> {
        let (events, rx): (UnboundedSender<WorkerEvent>, UnboundedReceiver<WorkerEvent>) = mpsc::unbounded_channel();
        let this: Arc<Self> = Arc::new(Self {
            round,
            state: Mutex::new(RegistryState { endpoints: vec![], workers_by_pid: HashMap::new(), pids_by_address: HashMap::new() }),
            events,
        });
        tokio::spawn(Self::event_pump(Arc::downgrade(&this), rx));
        this
    }

    /// The background task that takes workers out of rotation when they report trouble mid-dispatch.
    async fn event_pump(this: Weak<Self>, mut rx: UnboundedReceiver<WorkerEvent>) {
        while let Some(event) = rx.recv().await {
            let registry: Arc<Self> = match this.upgrade() {
                Some(registry) => registry,
                None => return,
            };
            match event {
                WorkerEvent::NotAvailable(pid) | WorkerEvent::NotAlive(pid) => {
                    debug!("Handling {event:?} for worker {pid}");
                    registry.drop_worker(pid);
                },
            }
        }
    }

    /// Registers a new worker: connects to its RPC endpoint and wires it into the matching servable endpoint.
    ///
    /// # Arguments
    /// - `spec`: The registration spec the worker sent.
    ///
    /// # Errors
    /// This function errors if the spec is invalid, clashes with what is already registered or the worker cannot be reached.
    pub async fn register(&self, spec: WorkerRegSpec) -> Result<(), RegistryError> {
        let WorkerRegSpec { worker_address, worker_pid, servable_spec } = spec;
        let address: Address = match Address::from_str(&worker_address) {
            Ok(address) => address,
            Err(err) => {
                return Err(RegistryError::IllegalAddress { raw: worker_address, err });
            },
        };
        if servable_spec.batch_size == 0 {
            return Err(RegistryError::BatchSizeZero { repr: servable_spec.repr() });
        }
        // Check before paying for the connection; checked again under the lock by `register_context()`
        if self.state.lock().unwrap().pids_by_address.contains_key(&worker_address) {
            return Err(RegistryError::DuplicateAddress { address: worker_address });
        }

        // Reach out to the worker, then wire it in
        let stub: GrpcNotifyWorker = match GrpcNotifyWorker::connect(address.clone()).await {
            Ok(stub) => stub,
            Err(err) => {
                return Err(RegistryError::ConnectError { address: worker_address, err });
            },
        };
        let ctx: Arc<WorkerContext> = Arc::new(WorkerContext::new(worker_pid, address, servable_spec, self.events.clone()));
        ctx.on_register(Arc::new(stub));
        self.register_context(ctx)
    }

    /// Wires an already connected worker context into the matching servable endpoint (creating it on first registration).
    ///
    /// # Arguments
    /// - `ctx`: The context to register.
    ///
    /// # Errors
    /// This function errors if the worker's address is already taken or its declaration is incompatible with its endpoint.
    pub fn register_context(&self, ctx: Arc<WorkerContext>) -> Result<(), RegistryError> {
        let mut state: MutexGuard<RegistryState> = self.state.lock().unwrap();
        let address_key: String = ctx.address().to_string();
        if state.pids_by_address.contains_key(&address_key) {
            return Err(RegistryError::DuplicateAddress { address: address_key });
        }

        // Find the endpoint this worker belongs to, or seed a new one
        let servable_name: &str = &ctx.spec().servable_name;
        let version_number: u64 = ctx.spec().version_number;
        let (endpoint, seeded): (Arc<ServableEndpoint>, bool) =
            match state.endpoints.iter().find(|e| e.servable_name() == servable_name && e.version_number() == version_number) {
                Some(endpoint) => (endpoint.clone(), false),
                None => {
                    let endpoint: Arc<ServableEndpoint> = Arc::new(ServableEndpoint::new(servable_name, version_number, self.round));
                    state.endpoints.push(endpoint.clone());
                    (endpoint, true)
                },
            };
        if let Err(err) = endpoint.register_worker(ctx.clone()) {
            if seeded {
                state.endpoints.retain(|e| !(e.servable_name() == servable_name && e.version_number() == version_number));
            }
            return Err(err);
        }

        state.workers_by_pid.insert(ctx.pid(), ctx.clone());
        state.pids_by_address.insert(address_key, ctx.pid());
        Ok(())
    }

    /// Unregisters the worker with the given address after it said a clean goodbye.
    ///
    /// # Errors
    /// This function errors if no worker with that address is registered.
    pub fn unregister(&self, worker_address: &str) -> Result<(), RegistryError> {
        let ctx: Arc<WorkerContext> = {
            let state: MutexGuard<RegistryState> = self.state.lock().unwrap();
            match state.pids_by_address.get(worker_address).and_then(|pid| state.workers_by_pid.get(pid)).cloned() {
                Some(ctx) => ctx,
                None => {
                    return Err(RegistryError::UnknownWorker { address: worker_address.into() });
                },
            }
        };
        ctx.on_exit();
        self.drop_worker(ctx.pid());
        Ok(())
    }

    /// Marks the worker with the given pid as failed-to-start and takes it out of rotation.
    ///
    /// # Arguments
    /// - `worker_pid`: The pid the worker reported.
    /// - `error_msg`: The error message the worker reported.
    ///
    /// # Errors
    /// This function errors if no worker with that pid is registered.
    pub fn notify_failed(&self, worker_pid: u64, error_msg: impl Into<String>) -> Result<(), RegistryError> {
        let ctx: Arc<WorkerContext> = match self.state.lock().unwrap().workers_by_pid.get(&worker_pid).cloned() {
            Some(ctx) => ctx,
            None => {
                return Err(RegistryError::UnknownPid { pid: worker_pid });
            },
        };
        ctx.on_start_error(error_msg);
        self.drop_worker(worker_pid);
        Ok(())
    }

    /// Takes the worker with the given pid out of its endpoint and out of the indexes. Idempotent.
    pub fn drop_worker(&self, pid: u64) {
        let mut state: MutexGuard<RegistryState> = self.state.lock().unwrap();
        let ctx: Arc<WorkerContext> = match state.workers_by_pid.remove(&pid) {
            Some(ctx) => ctx,
            None => {
                debug!("Worker {pid} already dropped");
                return;
            },
        };
        state.pids_by_address.remove(&ctx.address().to_string());
        for endpoint in &state.endpoints {
            if endpoint.remove_worker(pid) {
                break;
            }
        }
        info!("Dropped worker {pid} ({})", ctx.address());
    }

    /// Resolves the endpoint serving the given servable and version.
    ///
    /// # Arguments
    /// - `servable_name`: The servable to look for.
    /// - `version_number`: The version to look for, where 0 means "the latest registered version".
    ///
    /// # Returns
    /// The matching endpoint, or [`None`] if the servable (or that version of it) was never registered.
    pub fn find_endpoint(&self, servable_name: &str, version_number: u64) -> Option<Arc<ServableEndpoint>> {
        let state: MutexGuard<RegistryState> = self.state.lock().unwrap();
        if version_number != 0 {
            return state.endpoints.iter().find(|e| e.servable_name() == servable_name && e.version_number() == version_number).cloned();
        }
        state.endpoints.iter().filter(|e| e.servable_name() == servable_name).max_by_key(|e| e.version_number()).cloned()
    }

    /// Collects the introspection reply for the given servable and version (0 meaning "latest").
    ///
    /// # Errors
    /// This function errors if the servable (or that version of it) was never registered.
    pub fn get_model_info(&self, servable_name: &str, version_number: u64) -> Result<GetModelInfoReply, RegistryError> {
        let endpoint: Arc<ServableEndpoint> = match self.find_endpoint(servable_name, version_number) {
            Some(endpoint) => endpoint,
            None => {
                return Err(RegistryError::UnknownServable { name: servable_name.into(), version_number });
            },
        };
        Ok(GetModelInfoReply {
            error: None,
            servable_name: endpoint.servable_name().into(),
            version_number: endpoint.version_number(),
            batch_size: endpoint.batch_size(),
            methods: endpoint.methods(),
            workers: endpoint.worker_infos(),
        })
    }

    /// Returns a snapshot of every known worker, for the heart-beat watcher.
    pub fn worker_snapshot(&self) -> Vec<Arc<WorkerContext>> { self.state.lock().unwrap().workers_by_pid.values().cloned().collect() }

    /// Returns the sender with which [`WorkerContext`]s report their lifecycle events.
    #[inline]
    pub fn events(&self) -> UnboundedSender<WorkerEvent> { self.events.clone() }

    /// Shuts the registry down: completes every outstanding job with the stopped-servable error and asks every worker to exit.
    pub async fn shutdown(&self) {
        let (endpoints, workers): (Vec<Arc<ServableEndpoint>>, Vec<Arc<WorkerContext>>) = {
            let state: MutexGuard<RegistryState> = self.state.lock().unwrap();
            (state.endpoints.clone(), state.workers_by_pid.values().cloned().collect())
        };
        for endpoint in endpoints {
            endpoint.clear();
        }
        for worker in workers {
            worker.send_exit().await;
            worker.on_exit();
        }
        warn!("Worker registry shut down");
    }
}



#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use specifications::serving::{PredictReply, PredictRequest};
    use specifications::working::{MethodInfo, ServableRegSpec};
    use tonic::Status;

    use super::*;
    use crate::notify::NotifyWorker;

    /// A stub that answers every predict with an empty, successful reply.
    struct NopNotify;
    #[async_trait]
    impl NotifyWorker for NopNotify {
        async fn predict(&self, request: PredictRequest) -> Result<PredictReply, Status> {
            Ok(PredictReply { spec: request.spec, instances: request.instances, error_msg: vec![] })
        }

        async fn exit(&self) -> Result<(), Status> { Ok(()) }

        async fn ping(&self, _deadline: Duration) -> Result<(), Status> { Ok(()) }
    }

    /// Builds a ready context registered under the given servable version.
    fn ready_context(registry: &WorkerRegistry, pid: u64, version_number: u64) -> Arc<WorkerContext> {
        let spec: ServableRegSpec = ServableRegSpec {
            servable_name: "test_servable".into(),
            version_number,
            batch_size: 1,
            methods: vec![MethodInfo { name: "add_common".into(), input_names: vec!["x1".into(), "x2".into()] }],
            own_device: true,
        };
        let ctx: Arc<WorkerContext> =
            Arc::new(WorkerContext::new(pid, Address::hostname("worker", 6000 + pid as u16), spec, registry.events()));
        ctx.on_register(Arc::new(NopNotify));
        ctx
    }

    #[tokio::test]
    async fn version_routing_prefers_latest() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        registry.register_context(ready_context(&registry, 1, 1)).unwrap();
        registry.register_context(ready_context(&registry, 2, 2)).unwrap();

        assert_eq!(registry.find_endpoint("test_servable", 1).unwrap().version_number(), 1);
        assert_eq!(registry.find_endpoint("test_servable", 2).unwrap().version_number(), 2);
        // 0 means latest
        assert_eq!(registry.find_endpoint("test_servable", 0).unwrap().version_number(), 2);
        assert!(registry.find_endpoint("test_servable", 3).is_none());
        assert!(registry.find_endpoint("other_servable", 0).is_none());
    }

    #[tokio::test]
    async fn duplicate_addresses_are_rejected() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        registry.register_context(ready_context(&registry, 1, 1)).unwrap();
        assert!(matches!(
            registry.register_context(ready_context(&registry, 1, 1)),
            Err(RegistryError::DuplicateAddress { .. })
        ));
    }

    #[tokio::test]
    async fn unavailable_workers_are_dropped() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        let ctx: Arc<WorkerContext> = ready_context(&registry, 1, 1);
        registry.register_context(ctx.clone()).unwrap();
        assert_eq!(registry.find_endpoint("test_servable", 1).unwrap().worker_count(), 1);

        // The event pump picks this up and pulls the worker from its endpoint
        ctx.notify_not_available();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.find_endpoint("test_servable", 1).unwrap().worker_count(), 0);
        assert!(registry.worker_snapshot().is_empty());
    }

    #[tokio::test]
    async fn unregister_requires_known_address() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        registry.register_context(ready_context(&registry, 1, 1)).unwrap();
        assert!(matches!(registry.unregister("worker:9999"), Err(RegistryError::UnknownWorker { .. })));
        registry.unregister("worker:6001").unwrap();
        assert!(registry.worker_snapshot().is_empty());
    }

    #[tokio::test]
    async fn model_info_reports_signature() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        registry.register_context(ready_context(&registry, 1, 2)).unwrap();

        let info: GetModelInfoReply = registry.get_model_info("test_servable", 0).unwrap();
        assert_eq!(info.servable_name, "test_servable");
        assert_eq!(info.version_number, 2);
        assert_eq!(info.batch_size, 1);
        assert_eq!(info.methods.len(), 1);
        assert_eq!(info.workers.len(), 1);
        assert_eq!(info.workers[0].status, "Ready");
        assert!(matches!(registry.get_model_info("nope", 0), Err(RegistryError::UnknownServable { .. })));
    }
}
