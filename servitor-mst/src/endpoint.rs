//  ENDPOINT.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 14:02:19
//  Last edited:
//    31 Jul 2024, 14:10:52
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the ServableEndpoint, which groups the MethodDispatchers
//!   that share a servable name/version and the set of workers
//!   registered under it.
//

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};
use specifications::serving::{PredictReply, PredictRequest};
use specifications::working::{MethodInfo, ServableRegSpec, WorkerInfo};

use crate::context::WorkerContext;
use crate::errors::{DispatchError, RegistryError};
use crate::method::MethodDispatcher;
use crate::spec::PredictOnFinish;


/***** HELPER STRUCTS *****/
/// The state of a [`ServableEndpoint`].
struct EndpointState {
    /// The batch size every worker of this servable declared.
    batch_size:  u64,
    /// The method set every worker of this servable declared.
    methods:     Vec<MethodInfo>,
    /// One scheduler per declared method.
    dispatchers: HashMap<String, MethodDispatcher>,
    /// The workers currently registered under this servable.
    workers:     Vec<Arc<WorkerContext>>,
}





/***** LIBRARY *****/
/// Groups the per-method schedulers of one (servable, version) pair with the workers that serve it.
///
/// The first worker to register fixes the method set and batch size; every later worker must declare the same or is rejected.
pub struct ServableEndpoint {
    /// The name of the servable.
    servable_name:  String,
    /// The version of the servable.
    version_number: u64,
    /// The initial credit handed to every worker of every method.
    round: i64,
    /// The mutable state.
    state: Mutex<EndpointState>,
}

impl ServableEndpoint {
    /// Constructor for the ServableEndpoint.
    ///
    /// # Arguments
    /// - `servable_name`: The name of the servable this endpoint groups.
    /// - `version_number`: The version of the servable this endpoint groups.
    /// - `round`: The initial credit handed to every worker of every method.
    ///
    /// # Returns
    /// A new ServableEndpoint instance, without any methods or workers yet.
    pub fn new(servable_name: impl Into<String>, version_number: u64, round: i64) -> Self {
        Self {
            servable_name: servable_name.into(),
            version_number,
            round,
            state: Mutex::new(EndpointState { batch_size: 0, methods: vec![], dispatchers: HashMap::new(), workers: vec![] }),
        }
    }

    /// Registers a worker under this endpoint.
    ///
    /// The first worker seeds one MethodDispatcher per declared method; later workers must declare the same method set and batch size.
    ///
    /// # Arguments
    /// - `worker`: The worker to register.
    ///
    /// # Errors
    /// This function errors if the worker's declaration is incompatible with what this endpoint was seeded with.
    pub fn register_worker(&self, worker: Arc<WorkerContext>) -> Result<(), RegistryError> {
        let spec: &ServableRegSpec = worker.spec();
        let mut state: MutexGuard<EndpointState> = self.state.lock().unwrap();

        if state.workers.is_empty() {
            // First registration seeds the endpoint
            if spec.batch_size == 0 {
                return Err(RegistryError::BatchSizeZero { repr: spec.repr() });
            }
            state.batch_size = spec.batch_size;
            state.methods = spec.methods.clone();
            for method in &spec.methods {
                let dispatcher: MethodDispatcher =
                    MethodDispatcher::new(&self.servable_name, self.version_number, method.clone(), spec.batch_size, self.round);
                state.dispatchers.insert(method.name.clone(), dispatcher);
            }
        } else {
            // Later registrations must match
            if spec.batch_size != state.batch_size {
                return Err(RegistryError::IncompatibleBatchSize { repr: spec.repr(), expected: state.batch_size, got: spec.batch_size });
            }
            let mut declared: Vec<&str> = spec.methods.iter().map(|m| m.name.as_str()).collect();
            let mut known: Vec<&str> = state.methods.iter().map(|m| m.name.as_str()).collect();
            declared.sort_unstable();
            known.sort_unstable();
            if declared != known {
                return Err(RegistryError::IncompatibleMethods { repr: spec.repr(), address: worker.address().to_string() });
            }
        }

        // Wire the worker into every method's scheduler
        let mut method_names: Vec<String> = Vec::with_capacity(state.dispatchers.len());
        for (name, dispatcher) in &state.dispatchers {
            if let Err(err) = dispatcher.add_worker(worker.clone()) {
                warn!("{err}");
                continue;
            }
            method_names.push(name.clone());
        }
        state.workers.push(worker.clone());
        info!(
            "Register to servable endpoint success, servable name: {}, version number: {}, methods: {:?}, worker address: {}",
            self.servable_name,
            self.version_number,
            method_names,
            worker.address()
        );
        Ok(())
    }

    /// Removes a worker from this endpoint and all its method schedulers.
    ///
    /// # Arguments
    /// - `pid`: The pid of the worker to remove.
    ///
    /// # Returns
    /// Whether a worker with that pid was registered here at all.
    pub fn remove_worker(&self, pid: u64) -> bool {
        let mut state: MutexGuard<EndpointState> = self.state.lock().unwrap();
        let Some(pos) = state.workers.iter().position(|w| w.pid() == pid) else {
            return false;
        };
        let worker: Arc<WorkerContext> = state.workers.remove(pos);
        for dispatcher in state.dispatchers.values() {
            dispatcher.remove_worker(pid);
        }
        info!(
            "Unregister worker success, servable name: {}, version number: {}, worker address: {}",
            self.servable_name,
            self.version_number,
            worker.address()
        );
        true
    }

    /// Routes a request to the scheduler of its method.
    ///
    /// The completion callback is invoked exactly once, possibly right here if the method has no scheduler.
    ///
    /// # Arguments
    /// - `request`: The request to route.
    /// - `on_finish`: The completion callback to invoke with the assembled reply.
    pub fn dispatch(&self, request: PredictRequest, on_finish: PredictOnFinish) {
        let dispatcher: Option<MethodDispatcher> = self.state.lock().unwrap().dispatchers.get(&request.spec.method_name).cloned();
        match dispatcher {
            Some(dispatcher) => dispatcher.push_request(request, on_finish),
            None => {
                let err = DispatchError::NoModelThread { method: request.spec.method_name.clone() };
                warn!("{err}");
                on_finish(PredictReply { spec: request.spec, instances: vec![], error_msg: vec![err.to_error_msg()] });
            },
        }
    }

    /// Returns whether this endpoint declares the given method.
    #[inline]
    pub fn has_method(&self, method_name: &str) -> bool { self.state.lock().unwrap().dispatchers.contains_key(method_name) }

    /// Returns the name of the servable this endpoint groups.
    #[inline]
    pub fn servable_name(&self) -> &str { &self.servable_name }

    /// Returns the version of the servable this endpoint groups.
    #[inline]
    pub fn version_number(&self) -> u64 { self.version_number }

    /// Returns the batch size the servable's workers declared (0 before the first registration).
    #[inline]
    pub fn batch_size(&self) -> u64 { self.state.lock().unwrap().batch_size }

    /// Returns the method set the servable's workers declared.
    #[inline]
    pub fn methods(&self) -> Vec<MethodInfo> { self.state.lock().unwrap().methods.clone() }

    /// Returns the number of workers currently registered under this endpoint.
    #[inline]
    pub fn worker_count(&self) -> usize { self.state.lock().unwrap().workers.len() }

    /// Summarizes the registered workers for introspection replies.
    pub fn worker_infos(&self) -> Vec<WorkerInfo> {
        let state: MutexGuard<EndpointState> = self.state.lock().unwrap();
        state
            .workers
            .iter()
            .map(|w| WorkerInfo {
                pid: w.pid(),
                address: w.address().to_string(),
                status: w.status_name(),
                total_normal: w.total_normal(),
                total_abnormal: w.total_abnormal(),
                own_device: w.owns_device(),
            })
            .collect()
    }

    /// Shuts this endpoint down: every outstanding job in every method scheduler is completed with the stopped-servable error.
    pub fn clear(&self) {
        let state: MutexGuard<EndpointState> = self.state.lock().unwrap();
        for dispatcher in state.dispatchers.values() {
            dispatcher.clear();
        }
    }
}



#[cfg(test)]
mod tests {
    use specifications::address::Address;
    use specifications::serving::{ServableSpec, StatusCode};
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::spec::WorkerEvent;

    fn reg_spec(batch_size: u64, methods: &[&str]) -> ServableRegSpec {
        ServableRegSpec {
            servable_name: "test_servable".into(),
            version_number: 1,
            batch_size,
            methods: methods.iter().map(|m| MethodInfo { name: (*m).into(), input_names: vec!["x1".into(), "x2".into()] }).collect(),
            own_device: true,
        }
    }

    fn worker(pid: u64, spec: ServableRegSpec) -> Arc<WorkerContext> {
        let (tx, _rx) = mpsc::unbounded_channel::<WorkerEvent>();
        Arc::new(WorkerContext::new(pid, Address::hostname("worker", 6000 + pid as u16), spec, tx))
    }

    #[tokio::test]
    async fn first_worker_seeds_methods() {
        let endpoint: ServableEndpoint = ServableEndpoint::new("test_servable", 1, 3);
        endpoint.register_worker(worker(1, reg_spec(4, &["add_common", "sub_common"]))).unwrap();
        assert!(endpoint.has_method("add_common"));
        assert!(endpoint.has_method("sub_common"));
        assert!(!endpoint.has_method("mul_common"));
        assert_eq!(endpoint.batch_size(), 4);
        assert_eq!(endpoint.worker_count(), 1);
    }

    #[tokio::test]
    async fn incompatible_workers_are_rejected() {
        let endpoint: ServableEndpoint = ServableEndpoint::new("test_servable", 1, 3);
        endpoint.register_worker(worker(1, reg_spec(4, &["add_common"]))).unwrap();
        assert!(matches!(
            endpoint.register_worker(worker(2, reg_spec(8, &["add_common"]))),
            Err(RegistryError::IncompatibleBatchSize { expected: 4, got: 8, .. })
        ));
        assert!(matches!(
            endpoint.register_worker(worker(3, reg_spec(4, &["add_common", "sub_common"]))),
            Err(RegistryError::IncompatibleMethods { .. })
        ));
        assert!(matches!(
            ServableEndpoint::new("test_servable", 1, 3).register_worker(worker(4, reg_spec(0, &["add_common"]))),
            Err(RegistryError::BatchSizeZero { .. })
        ));
        assert_eq!(endpoint.worker_count(), 1);
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let endpoint: ServableEndpoint = ServableEndpoint::new("test_servable", 1, 3);
        endpoint.register_worker(worker(1, reg_spec(1, &["add_common"]))).unwrap();

        let (tx, rx) = oneshot::channel();
        endpoint.dispatch(
            PredictRequest {
                spec: ServableSpec { name: "test_servable".into(), version_number: 1, method_name: "mul_common".into(), },
                instances: vec![],
            },
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        let reply: PredictReply = rx.await.unwrap();
        assert_eq!(reply.error_msg.len(), 1);
        assert_eq!(reply.error_msg[0].code(), Some(StatusCode::Failed));
        assert!(reply.error_msg[0].error_msg.contains("Cannot find model thread of method mul_common"));
    }

    #[tokio::test]
    async fn remove_worker_propagates() {
        let endpoint: ServableEndpoint = ServableEndpoint::new("test_servable", 1, 3);
        endpoint.register_worker(worker(1, reg_spec(1, &["add_common"]))).unwrap();
        assert!(endpoint.remove_worker(1));
        assert!(!endpoint.remove_worker(1));
        assert_eq!(endpoint.worker_count(), 0);
    }
}
