//  DISPATCHER.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 16:10:08
//  Last edited:
//    31 Jul 2024, 15:40:11
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the top-level Dispatcher: the façade shared by all
//!   frontends. It performs admission control, matches requests onto a
//!   servable endpoint and delegates the rest of the work.
//

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::error;
use specifications::serving::{PredictReply, PredictRequest};
use specifications::working::GetModelInfoReply;

use crate::endpoint::ServableEndpoint;
use crate::errors::{DispatchError, RegistryError};
use crate::registry::WorkerRegistry;
use crate::spec::PredictOnFinish;


/***** LIBRARY *****/
/// The façade through which every frontend reaches the dispatcher core.
///
/// Clones share the same registry and admission counter, so each frontend can own a copy.
#[derive(Clone)]
pub struct Dispatcher {
    /// The registry that owns the endpoints and the workers.
    registry: Arc<WorkerRegistry>,
    /// How many requests are pending in the master right now.
    enqueued_requests: Arc<AtomicU32>,
    /// The soft cap on `enqueued_requests` above which new requests are refused.
    max_enqueued_requests: u32,
}

impl Dispatcher {
    /// Constructor for the Dispatcher.
    ///
    /// # Arguments
    /// - `registry`: The registry that owns the endpoints and the workers.
    /// - `max_enqueued_requests`: The soft cap on pending requests above which new ones are refused.
    ///
    /// # Returns
    /// A new Dispatcher instance.
    #[inline]
    pub fn new(registry: Arc<WorkerRegistry>, max_enqueued_requests: u32) -> Self {
        Self { registry, enqueued_requests: Arc::new(AtomicU32::new(0)), max_enqueued_requests }
    }

    /// Dispatches a predict request to the endpoint serving its servable.
    ///
    /// The completion callback is invoked exactly once, on whichever runtime completes the request's last task (or right here, if the request
    /// is refused outright).
    ///
    /// # Arguments
    /// - `request`: The request to dispatch.
    /// - `on_finish`: The completion callback to invoke with the assembled reply.
    pub fn dispatch(&self, request: PredictRequest, on_finish: PredictOnFinish) {
        // Admission control first
        let pending: u32 = self.enqueued_requests.fetch_add(1, Ordering::SeqCst);
        if pending >= self.max_enqueued_requests {
            self.enqueued_requests.fetch_sub(1, Ordering::SeqCst);
            let err = DispatchError::TooManyRequests { limit: self.max_enqueued_requests };
            error!("{err}");
            on_finish(PredictReply { spec: request.spec, instances: vec![], error_msg: vec![err.to_error_msg()] });
            return;
        }

        // Make sure the counter goes down again no matter who completes the request
        let counter: Arc<AtomicU32> = self.enqueued_requests.clone();
        let on_finish: PredictOnFinish = Box::new(move |reply| {
            counter.fetch_sub(1, Ordering::SeqCst);
            on_finish(reply);
        });

        // Match the request onto an endpoint
        let endpoint: Arc<ServableEndpoint> = match self.registry.find_endpoint(&request.spec.name, request.spec.version_number) {
            Some(endpoint) => endpoint,
            None => {
                let err = DispatchError::ServableNotAvailable { repr: request.spec.repr() };
                error!("{err}");
                on_finish(PredictReply { spec: request.spec, instances: vec![], error_msg: vec![err.to_error_msg()] });
                return;
            },
        };
        if !endpoint.has_method(&request.spec.method_name) {
            let err = DispatchError::MethodNotAvailable { repr: request.spec.repr() };
            error!("{err}");
            on_finish(PredictReply { spec: request.spec, instances: vec![], error_msg: vec![err.to_error_msg()] });
            return;
        }

        // Stamp the resolved version, so a "latest" request reports which version actually served it
        let mut request: PredictRequest = request;
        request.spec.version_number = endpoint.version_number();
        endpoint.dispatch(request, on_finish);
    }

    /// Collects the introspection reply for the given servable and version (0 meaning "latest").
    ///
    /// # Errors
    /// This function errors if the servable (or that version of it) was never registered.
    #[inline]
    pub fn get_model_info(&self, servable_name: &str, version_number: u64) -> Result<GetModelInfoReply, RegistryError> {
        self.registry.get_model_info(servable_name, version_number)
    }

    /// Returns the registry that owns the endpoints and the workers.
    #[inline]
    pub fn registry(&self) -> &Arc<WorkerRegistry> { &self.registry }

    /// Returns how many requests are pending in the master right now.
    #[inline]
    pub fn pending_requests(&self) -> u32 { self.enqueued_requests.load(Ordering::SeqCst) }
}



#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use specifications::address::Address;
    use specifications::serving::{Instance, ServableSpec, StatusCode, Tensor as WireTensor};
    use specifications::tensor::Tensor;
    use specifications::working::{MethodInfo, ServableRegSpec};
    use tokio::sync::{oneshot, Notify};
    use tonic::Status;

    use super::*;
    use crate::context::WorkerContext;
    use crate::notify::NotifyWorker;

    /// A stub worker that sums `x1` and `x2` element-wise into `y`.
    struct AddNotify;
    #[async_trait]
    impl NotifyWorker for AddNotify {
        async fn predict(&self, request: PredictRequest) -> Result<PredictReply, Status> {
            let mut instances: Vec<Instance> = Vec::with_capacity(request.instances.len());
            for instance in &request.instances {
                let x1: Vec<f32> = Tensor::try_from(instance.items["x1"].clone()).unwrap().to_f32_vec().unwrap();
                let x2: Vec<f32> = Tensor::try_from(instance.items["x2"].clone()).unwrap().to_f32_vec().unwrap();
                let shape: Vec<i64> = instance.items["x1"].shape.dims.clone();
                let y: Vec<f32> = x1.iter().zip(x2.iter()).map(|(a, b)| a + b).collect();
                instances.push(Instance {
                    items: HashMap::from([("y".to_string(), WireTensor::from(Tensor::from_f32(shape, &y).unwrap()))]),
                });
            }
            Ok(PredictReply { spec: request.spec, instances, error_msg: vec![] })
        }

        async fn exit(&self) -> Result<(), Status> { Ok(()) }

        async fn ping(&self, _deadline: Duration) -> Result<(), Status> { Ok(()) }
    }

    /// A stub worker that holds every predict until released, then reports back-pressure.
    struct StallNotify {
        release: Notify,
    }
    #[async_trait]
    impl NotifyWorker for StallNotify {
        async fn predict(&self, request: PredictRequest) -> Result<PredictReply, Status> {
            self.release.notified().await;
            Ok(PredictReply::failed(request.spec, StatusCode::WorkerUnavailable, "Servable stopped"))
        }

        async fn exit(&self) -> Result<(), Status> { Ok(()) }

        async fn ping(&self, _deadline: Duration) -> Result<(), Status> { Ok(()) }
    }

    fn register_worker(registry: &WorkerRegistry, pid: u64, version_number: u64, notify: Arc<dyn NotifyWorker>) {
        let spec: ServableRegSpec = ServableRegSpec {
            servable_name: "test_servable".into(),
            version_number,
            batch_size: 1,
            methods: vec![MethodInfo { name: "add_common".into(), input_names: vec!["x1".into(), "x2".into()] }],
            own_device: true,
        };
        let ctx: Arc<WorkerContext> =
            Arc::new(WorkerContext::new(pid, Address::hostname("worker", 6000 + pid as u16), spec, registry.events()));
        ctx.on_register(notify);
        registry.register_context(ctx).unwrap();
    }

    fn add_instance(x1: &[f32], x2: &[f32]) -> Instance {
        Instance {
            items: HashMap::from([
                ("x1".to_string(), WireTensor::from(Tensor::from_f32(vec![x1.len() as i64], x1).unwrap())),
                ("x2".to_string(), WireTensor::from(Tensor::from_f32(vec![x2.len() as i64], x2).unwrap())),
            ]),
        }
    }

    async fn run(dispatcher: &Dispatcher, spec: ServableSpec, instances: Vec<Instance>) -> PredictReply {
        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(
            PredictRequest { spec, instances },
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        rx.await.unwrap()
    }

    fn spec(name: &str, version_number: u64, method_name: &str) -> ServableSpec {
        ServableSpec { name: name.into(), version_number, method_name: method_name.into() }
    }

    #[tokio::test]
    async fn dispatch_reaches_worker() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        register_worker(&registry, 1, 1, Arc::new(AddNotify));
        let dispatcher: Dispatcher = Dispatcher::new(registry, 100);

        let reply: PredictReply = run(&dispatcher, spec("test_servable", 1, "add_common"), vec![add_instance(&[1.0], &[2.0])]).await;
        assert!(reply.error_msg.is_empty());
        assert_eq!(reply.instances.len(), 1);
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn version_zero_routes_to_latest() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        register_worker(&registry, 1, 1, Arc::new(AddNotify));
        register_worker(&registry, 2, 2, Arc::new(AddNotify));
        let dispatcher: Dispatcher = Dispatcher::new(registry, 100);

        let reply: PredictReply = run(&dispatcher, spec("test_servable", 0, "add_common"), vec![add_instance(&[1.0], &[2.0])]).await;
        assert!(reply.error_msg.is_empty());
        assert_eq!(reply.spec.version_number, 2);
    }

    #[tokio::test]
    async fn unknown_servable_and_version_fail() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        register_worker(&registry, 1, 1, Arc::new(AddNotify));
        let dispatcher: Dispatcher = Dispatcher::new(registry, 100);

        let reply: PredictReply =
            run(&dispatcher, spec("test_servable_error", 0, "add_common"), vec![add_instance(&[1.0], &[2.0])]).await;
        assert_eq!(reply.error_msg.len(), 1);
        assert!(reply.error_msg[0].error_msg.contains("servable is not available"));

        let reply: PredictReply = run(&dispatcher, spec("test_servable", 2, "add_common"), vec![add_instance(&[1.0], &[2.0])]).await;
        assert_eq!(reply.error_msg.len(), 1);
        assert!(reply.error_msg[0].error_msg.contains("servable is not available"));
    }

    #[tokio::test]
    async fn unknown_method_fails() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        register_worker(&registry, 1, 1, Arc::new(AddNotify));
        let dispatcher: Dispatcher = Dispatcher::new(registry, 100);

        let reply: PredictReply =
            run(&dispatcher, spec("test_servable", 1, "add_common_error"), vec![add_instance(&[1.0], &[2.0])]).await;
        assert_eq!(reply.error_msg.len(), 1);
        assert_eq!(reply.error_msg[0].code(), Some(StatusCode::InvalidInputs));
        assert!(reply.error_msg[0].error_msg.contains("method is not available"));
    }

    #[tokio::test]
    async fn admission_cap_bounds_pending_requests() {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        let stalling: Arc<StallNotify> = Arc::new(StallNotify { release: Notify::new() });
        register_worker(&registry, 1, 1, stalling.clone());
        let dispatcher: Dispatcher = Dispatcher::new(registry, 2);

        let (tx1, rx1) = oneshot::channel();
        dispatcher.dispatch(
            PredictRequest { spec: spec("test_servable", 1, "add_common"), instances: vec![add_instance(&[1.0], &[2.0])] },
            Box::new(move |reply| {
                let _ = tx1.send(reply);
            }),
        );
        let (tx2, rx2) = oneshot::channel();
        dispatcher.dispatch(
            PredictRequest { spec: spec("test_servable", 1, "add_common"), instances: vec![add_instance(&[1.0], &[2.0])] },
            Box::new(move |reply| {
                let _ = tx2.send(reply);
            }),
        );
        assert_eq!(dispatcher.pending_requests(), 2);

        // The third one bounces off the cap
        let reply: PredictReply = run(&dispatcher, spec("test_servable", 1, "add_common"), vec![add_instance(&[1.0], &[2.0])]).await;
        assert_eq!(reply.error_msg.len(), 1);
        assert_eq!(reply.error_msg[0].code(), Some(StatusCode::SystemError));
        assert!(reply.error_msg[0].error_msg.contains("Too many requests pending"));

        // Releasing the worker drains the counter again
        stalling.release.notify_waiters();
        let _ = rx1.await.unwrap();
        let _ = rx2.await.unwrap();
        assert_eq!(dispatcher.pending_requests(), 0);
    }
}
