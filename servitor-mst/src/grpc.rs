//  GRPC.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 17:15:02
//  Last edited:
//    31 Jul 2024, 16:31:44
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the gRPC frontends of the master: the client-facing
//!   PredictService and the worker-facing MasterService. Handlers are
//!   fully asynchronous; a predict handler parks on a oneshot channel
//!   until the dispatcher fires the completion callback.
//

use std::sync::Arc;

use error_trace::ErrorTrace as _;
use log::{debug, error, info};
use specifications::serving::{ErrorMsg, PredictReply, PredictRequest, PredictService, StatusCode};
use specifications::working::{
    ExitReply, ExitRequest, GetModelInfoReply, GetModelInfoRequest, MasterService, NotifyFailedReply, NotifyFailedRequest, PongReply,
    PongRequest, RegisterReply, RegisterRequest,
};
use tokio::sync::oneshot;
use tonic::{Request, Response, Status};

use crate::dispatcher::Dispatcher;
use crate::heartbeat::Watcher;


/***** LIBRARY *****/
/// The client-facing gRPC frontend.
#[derive(Clone)]
pub struct PredictHandler {
    /// The dispatcher shared by all frontends.
    dispatcher: Dispatcher,
}
impl PredictHandler {
    /// Constructor for the PredictHandler.
    ///
    /// # Arguments
    /// - `dispatcher`: The dispatcher shared by all frontends.
    #[inline]
    pub fn new(dispatcher: Dispatcher) -> Self { Self { dispatcher } }
}

#[tonic::async_trait]
impl PredictService for PredictHandler {
    /// Runs a predict request through the dispatcher and waits for its reply.
    ///
    /// Request-level failures travel inside the reply's `error_msg` array; a `tonic::Status` error only means the master itself broke down.
    async fn predict(&self, request: Request<PredictRequest>) -> Result<Response<PredictReply>, Status> {
        let request: PredictRequest = request.into_inner();
        debug!("Handling incoming predict request, {}", request.spec.repr());

        // Hand the reply slot to the dispatcher and park until the completion callback fires
        let (tx, rx): (oneshot::Sender<PredictReply>, oneshot::Receiver<PredictReply>) = oneshot::channel();
        self.dispatcher.dispatch(
            request,
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        match rx.await {
            Ok(reply) => Ok(Response::new(reply)),
            Err(_) => Err(Status::internal("Reply channel closed before the request completed")),
        }
    }
}



/// The worker-facing gRPC frontend.
#[derive(Clone)]
pub struct MasterHandler {
    /// The dispatcher shared by all frontends.
    dispatcher: Dispatcher,
    /// The heart-beat watcher whose table incoming pongs land in, if liveness probing is enabled.
    watcher:    Option<Arc<Watcher>>,
}
impl MasterHandler {
    /// Constructor for the MasterHandler.
    ///
    /// # Arguments
    /// - `dispatcher`: The dispatcher shared by all frontends.
    /// - `watcher`: The heart-beat watcher to feed incoming pongs to, if liveness probing is enabled.
    #[inline]
    pub fn new(dispatcher: Dispatcher, watcher: Option<Arc<Watcher>>) -> Self { Self { dispatcher, watcher } }
}

#[tonic::async_trait]
impl MasterService for MasterHandler {
    /// Handles a worker announcing itself. Registration failures travel in the reply's `error` field so the worker can log them.
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterReply>, Status> {
        let spec = request.into_inner().spec;
        info!("Handling worker registration from '{}' (pid {})", spec.worker_address, spec.worker_pid);
        match self.dispatcher.registry().register(spec).await {
            Ok(_) => Ok(Response::new(RegisterReply { error: None })),
            Err(err) => {
                error!("{}", err.trace());
                Ok(Response::new(RegisterReply { error: Some(ErrorMsg::new(StatusCode::Failed, err.to_string())) }))
            },
        }
    }

    /// Handles a worker saying a clean goodbye. Saying goodbye twice is not an error worth reporting back.
    async fn exit(&self, request: Request<ExitRequest>) -> Result<Response<ExitReply>, Status> {
        let address: String = request.into_inner().address;
        info!("Handling worker exit from '{address}'");
        if let Err(err) = self.dispatcher.registry().unregister(&address) {
            debug!("{}", err.trace());
        }
        Ok(Response::new(ExitReply {}))
    }

    /// Handles a worker reporting that it failed to start.
    async fn notify_failed(&self, request: Request<NotifyFailedRequest>) -> Result<Response<NotifyFailedReply>, Status> {
        let request: NotifyFailedRequest = request.into_inner();
        error!("Worker {} reports start-up failure: {}", request.worker_pid, request.error_msg);
        if let Err(err) = self.dispatcher.registry().notify_failed(request.worker_pid, request.error_msg) {
            debug!("{}", err.trace());
        }
        Ok(Response::new(NotifyFailedReply {}))
    }

    /// Handles an introspection request about a registered servable. Failures travel in the reply's `error` field.
    async fn get_model_info(&self, request: Request<GetModelInfoRequest>) -> Result<Response<GetModelInfoReply>, Status> {
        let request: GetModelInfoRequest = request.into_inner();
        debug!("Handling model info request for '{}' (version {})", request.servable_name, request.version_number);
        match self.dispatcher.get_model_info(&request.servable_name, request.version_number) {
            Ok(reply) => Ok(Response::new(reply)),
            Err(err) => Ok(Response::new(GetModelInfoReply {
                error: Some(ErrorMsg::new(StatusCode::InvalidInputs, err.to_string())),
                ..Default::default()
            })),
        }
    }

    /// Handles a worker answering one of our liveness probes on its own connection: its missed-pong counter goes back to 0.
    async fn pong(&self, request: Request<PongRequest>) -> Result<Response<PongReply>, Status> {
        let address: String = request.into_inner().address;
        debug!("Recv pong from '{address}'");
        if let Some(watcher) = &self.watcher {
            watcher.recv_pong(&address);
        }
        Ok(Response::new(PongReply {}))
    }
}



#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use specifications::address::Address;
    use specifications::serving::{Instance, ServableSpec, Tensor as WireTensor};
    use specifications::tensor::Tensor;
    use specifications::working::{MethodInfo, ServableRegSpec};

    use super::*;
    use crate::context::WorkerContext;
    use crate::notify::NotifyWorker;
    use crate::registry::WorkerRegistry;
    use crate::spec::HeartbeatConfig;

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

    /// A stub worker that never answers probes directly; it only pongs on its own connection.
    struct NoPongNotify;
    #[async_trait]
    impl NotifyWorker for NoPongNotify {
        async fn predict(&self, request: PredictRequest) -> Result<PredictReply, Status> {
            Ok(PredictReply { spec: request.spec, instances: request.instances, error_msg: vec![] })
        }

        async fn exit(&self) -> Result<(), Status> { Ok(()) }

        async fn ping(&self, _deadline: Duration) -> Result<(), Status> { Err(Status::deadline_exceeded("Ping timed out")) }
    }

    fn test_dispatcher_with(notify: Arc<dyn NotifyWorker>) -> Dispatcher {
        let registry: Arc<WorkerRegistry> = WorkerRegistry::new(3);
        let spec: ServableRegSpec = ServableRegSpec {
            servable_name: "test_servable".into(),
            version_number: 1,
            batch_size: 1,
            methods: vec![MethodInfo { name: "add_common".into(), input_names: vec!["x1".into(), "x2".into()] }],
            own_device: true,
        };
        let ctx: Arc<WorkerContext> = Arc::new(WorkerContext::new(1, Address::hostname("worker", 6001), spec, registry.events()));
        ctx.on_register(notify);
        registry.register_context(ctx).unwrap();
        Dispatcher::new(registry, 100)
    }

    fn test_dispatcher() -> Dispatcher { test_dispatcher_with(Arc::new(AddNotify)) }

    #[tokio::test]
    async fn pong_resets_liveness_counter() {
        // A worker that never answers probes accumulates misses until its out-of-band pong arrives
        let dispatcher: Dispatcher = test_dispatcher_with(Arc::new(NoPongNotify));
        let config: HeartbeatConfig =
            HeartbeatConfig { max_time_out: Duration::from_millis(200), max_ping_times: 20, ping_deadline: Duration::from_millis(1) };
        let watcher: Arc<Watcher> = Watcher::new(dispatcher.registry().clone(), config);
        let handle = watcher.clone().spawn();
        let handler: MasterHandler = MasterHandler::new(dispatcher, Some(watcher.clone()));

        // Let a few probes go unanswered, then freeze the loop so the assertion cannot race it
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert!(watcher.missed_pongs("worker:6001").unwrap_or(0) >= 1);

        handler.pong(Request::new(PongRequest { address: "worker:6001".into() })).await.unwrap();
        assert_eq!(watcher.missed_pongs("worker:6001"), Some(0));
    }

    #[tokio::test]
    async fn predict_handler_roundtrip() {
        let handler: PredictHandler = PredictHandler::new(test_dispatcher());
        let request: PredictRequest = PredictRequest {
            spec: ServableSpec { name: "test_servable".into(), version_number: 0, method_name: "add_common".into() },
            instances: vec![Instance {
                items: HashMap::from([
                    ("x1".to_string(), WireTensor::from(Tensor::from_f32([1], &[1.5]).unwrap())),
                    ("x2".to_string(), WireTensor::from(Tensor::from_f32([1], &[2.5]).unwrap())),
                ]),
            }],
        };
        let reply: PredictReply = handler.predict(Request::new(request)).await.unwrap().into_inner();
        assert!(reply.error_msg.is_empty());
        assert_eq!(reply.instances.len(), 1);
        let y: Vec<f32> = Tensor::try_from(reply.instances[0].items["y"].clone()).unwrap().to_f32_vec().unwrap();
        assert!((y[0] - 4.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn master_handler_introspection_and_exit() {
        let handler: MasterHandler = MasterHandler::new(test_dispatcher(), None);

        let info: GetModelInfoReply = handler
            .get_model_info(Request::new(GetModelInfoRequest { servable_name: "test_servable".into(), version_number: 0 }))
            .await
            .unwrap()
            .into_inner();
        assert!(info.error.is_none());
        assert_eq!(info.version_number, 1);
        assert_eq!(info.methods.len(), 1);

        let info: GetModelInfoReply = handler
            .get_model_info(Request::new(GetModelInfoRequest { servable_name: "unknown".into(), version_number: 0 }))
            .await
            .unwrap()
            .into_inner();
        assert!(info.error.is_some());

        // Unknown exits are acknowledged without fuss
        handler.exit(Request::new(ExitRequest { address: "worker:1234".into() })).await.unwrap();
        // Known exits pull the worker
        handler.exit(Request::new(ExitRequest { address: "worker:6001".into() })).await.unwrap();
        assert!(handler.dispatcher.registry().worker_snapshot().is_empty());
    }
}
