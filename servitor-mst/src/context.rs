//  CONTEXT.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 10:44:12
//  Last edited:
//    31 Jul 2024, 11:09:47
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the WorkerContext, the live representation of one
//!   registered worker process. It tracks the worker's lifecycle status
//!   and request counters, and forwards predict calls over the worker's
//!   RPC stub.
//

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use enum_debug::EnumDebug as _;
use log::{error, info};
use specifications::address::Address;
use specifications::serving::{ErrorMsg, PredictReply, PredictRequest};
use specifications::working::{MethodInfo, ServableRegSpec};
use tokio::sync::mpsc::UnboundedSender;
use tonic::Status;

use crate::errors::WorkerCallError;
use crate::notify::NotifyWorker;
use crate::spec::{WorkerEvent, WorkerStatus};


/***** LIBRARY *****/
/// The live representation of one registered worker process.
///
/// The status field is read lock-free on the dispatch path; transitions are serialized through the stub mutex, since a status change and
/// dropping the stub always go hand-in-hand. Every `notify_*`/`on_*` entry point is idempotent.
pub struct WorkerContext {
    /// The OS process identifier of the worker.
    pid:     u64,
    /// The address on which the worker's RPC endpoint listens.
    address: Address,
    /// The servable the worker declared at registration.
    spec:    ServableRegSpec,
    /// A preformatted representation of the servable for logs and errors.
    repr:    String,

    /// The current lifecycle status, as a [`WorkerStatus`] discriminant.
    status: AtomicU8,
    /// The RPC stub, present only while the worker is usable.
    notify: Mutex<Option<Arc<dyn NotifyWorker>>>,
    /// The start-up error the worker reported, if it did.
    notified_error: Mutex<Option<String>>,

    /// How many predict calls completed without errors over this worker's lifetime.
    total_normal:   AtomicU64,
    /// How many predict calls completed with errors over this worker's lifetime.
    total_abnormal: AtomicU64,
    /// How many predict calls are currently in flight to this worker.
    in_flight:      AtomicU64,

    /// The channel on which lifecycle events are reported to the owning registry.
    events: UnboundedSender<WorkerEvent>,
}

impl WorkerContext {
    /// Constructor for the WorkerContext.
    ///
    /// The new context starts in the [`WorkerStatus::Starting`] state; call [`WorkerContext::on_register()`] once the worker's `Register` call
    /// has been accepted.
    ///
    /// # Arguments
    /// - `pid`: The OS process identifier of the worker.
    /// - `address`: The address on which the worker's RPC endpoint listens.
    /// - `spec`: The servable the worker declared.
    /// - `events`: The channel on which lifecycle events are reported to the owning registry.
    ///
    /// # Returns
    /// A new WorkerContext instance.
    pub fn new(pid: u64, address: Address, spec: ServableRegSpec, events: UnboundedSender<WorkerEvent>) -> Self {
        let repr: String = spec.repr();
        Self {
            pid,
            address,
            spec,
            repr,
            status: AtomicU8::new(WorkerStatus::Starting as u8),
            notify: Mutex::new(None),
            notified_error: Mutex::new(None),
            total_normal: AtomicU64::new(0),
            total_abnormal: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            events,
        }
    }

    /// Stores the worker's RPC stub and marks it ready to accept predict calls.
    ///
    /// # Arguments
    /// - `notify`: The stub with which the worker may be reached.
    pub fn on_register(&self, notify: Arc<dyn NotifyWorker>) {
        let mut guard: MutexGuard<Option<Arc<dyn NotifyWorker>>> = self.notify.lock().unwrap();
        info!("Receive worker registered message, {}, worker pid: {}, worker address: {}", self.repr, self.pid, self.address);
        *guard = Some(notify);
        self.status.store(WorkerStatus::Ready as u8, Ordering::SeqCst);
    }

    /// Forwards the given (sub-)request to the worker and waits for its reply.
    ///
    /// The request counters are updated when the reply comes in: a reply without errors and with at least one instance counts as normal,
    /// anything else as abnormal.
    ///
    /// # Arguments
    /// - `request`: The PredictRequest holding a batch of at most `batch_size` instances.
    ///
    /// # Errors
    /// This function errors with [`WorkerCallError::NotReady`] if the worker is not in the `Ready` state, or with [`WorkerCallError::Rpc`] if
    /// the transport failed.
    pub async fn dispatch(&self, request: PredictRequest) -> Result<PredictReply, WorkerCallError> {
        // Snapshot the stub under the lock, then call outside of it
        let notify: Arc<dyn NotifyWorker> = {
            let guard: MutexGuard<Option<Arc<dyn NotifyWorker>>> = self.notify.lock().unwrap();
            match (self.status(), &*guard) {
                (WorkerStatus::Ready, Some(notify)) => notify.clone(),
                _ => {
                    return Err(WorkerCallError::NotReady { pid: self.pid });
                },
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let res: Result<PredictReply, Status> = notify.predict(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match res {
            Ok(reply) => {
                if reply.error_msg.iter().all(ErrorMsg::is_ok) && !reply.instances.is_empty() {
                    self.total_normal.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.total_abnormal.fetch_add(1, Ordering::SeqCst);
                }
                Ok(reply)
            },
            Err(err) => {
                self.total_abnormal.fetch_add(1, Ordering::SeqCst);
                Err(WorkerCallError::Rpc { pid: self.pid, err })
            },
        }
    }

    /// Probes the worker for liveness with the given per-ping deadline.
    ///
    /// # Errors
    /// This function errors if the worker has no stub anymore, did not answer within the deadline or the transport failed.
    pub async fn ping(&self, deadline: Duration) -> Result<(), Status> {
        let notify: Arc<dyn NotifyWorker> = {
            let guard: MutexGuard<Option<Arc<dyn NotifyWorker>>> = self.notify.lock().unwrap();
            match &*guard {
                Some(notify) => notify.clone(),
                None => {
                    return Err(Status::unavailable("Worker stub is gone"));
                },
            }
        };
        notify.ping(deadline).await
    }

    /// Asks the worker to exit cleanly, if it still has a stub. Any transport error is swallowed, since the worker may already be gone.
    pub async fn send_exit(&self) {
        let notify: Option<Arc<dyn NotifyWorker>> = self.notify.lock().unwrap().clone();
        if let Some(notify) = notify {
            if let Err(err) = notify.exit().await {
                info!("Worker {} did not acknowledge exit: {}", self.pid, err);
            }
        }
    }

    /// Marks that the worker said a clean goodbye.
    pub fn on_exit(&self) {
        let mut guard: MutexGuard<Option<Arc<dyn NotifyWorker>>> = self.notify.lock().unwrap();
        if self.status() == WorkerStatus::NotifyExit {
            return;
        }
        info!("Notify worker exit, {}, worker pid: {}, worker address: {}", self.repr, self.pid, self.address);
        self.status.store(WorkerStatus::NotifyExit as u8, Ordering::SeqCst);
        *guard = None;
    }

    /// Marks that the worker reported a start-up error or crash.
    ///
    /// # Arguments
    /// - `notified_error`: The error message the worker reported.
    pub fn on_start_error(&self, notified_error: impl Into<String>) {
        let mut guard: MutexGuard<Option<Arc<dyn NotifyWorker>>> = self.notify.lock().unwrap();
        if self.status() == WorkerStatus::NotifyFailed {
            return;
        }
        error!("Notify worker start-up error, {}, worker pid: {}", self.repr, self.pid);
        self.status.store(WorkerStatus::NotifyFailed as u8, Ordering::SeqCst);
        *guard = None;
        *self.notified_error.lock().unwrap() = Some(notified_error.into());
    }

    /// Marks that the worker reported back-pressure or an in-flight health failure, and tells the registry to pull it from its endpoint.
    pub fn notify_not_available(&self) {
        {
            let mut guard: MutexGuard<Option<Arc<dyn NotifyWorker>>> = self.notify.lock().unwrap();
            let status: WorkerStatus = self.status();
            if matches!(status, WorkerStatus::NotAvailable | WorkerStatus::NotifyExit | WorkerStatus::NotAlive) {
                return;
            }
            error!("Notify worker not available, {}, worker pid: {}", self.repr, self.pid);
            self.status.store(WorkerStatus::NotAvailable as u8, Ordering::SeqCst);
            *guard = None;
        }
        let _ = self.events.send(WorkerEvent::NotAvailable(self.pid));
    }

    /// Marks that the worker stopped answering liveness probes (or that its process died), and tells the registry to pull it from its endpoint.
    pub fn notify_not_alive(&self) {
        {
            let mut guard: MutexGuard<Option<Arc<dyn NotifyWorker>>> = self.notify.lock().unwrap();
            let status: WorkerStatus = self.status();
            if matches!(status, WorkerStatus::NotAlive | WorkerStatus::NotifyExit | WorkerStatus::NotifyFailed) {
                return;
            }
            info!("Notify worker not alive, {}, worker pid: {}, worker address: {}", self.repr, self.pid, self.address);
            self.status.store(WorkerStatus::NotAlive as u8, Ordering::SeqCst);
            *guard = None;
        }
        let _ = self.events.send(WorkerEvent::NotAlive(self.pid));
    }

    /// Returns the OS process identifier of the worker.
    #[inline]
    pub fn pid(&self) -> u64 { self.pid }

    /// Returns the address of the worker.
    #[inline]
    pub fn address(&self) -> &Address { &self.address }

    /// Returns the servable the worker declared at registration.
    #[inline]
    pub fn spec(&self) -> &ServableRegSpec { &self.spec }

    /// Returns the methods the worker declared at registration.
    #[inline]
    pub fn methods(&self) -> &[MethodInfo] { &self.spec.methods }

    /// Returns the batch size the worker declared at registration.
    #[inline]
    pub fn batch_size(&self) -> u64 { self.spec.batch_size }

    /// Returns whether the worker owns a device.
    #[inline]
    pub fn owns_device(&self) -> bool { self.spec.own_device }

    /// Returns the current lifecycle status of the worker.
    #[inline]
    pub fn status(&self) -> WorkerStatus { WorkerStatus::from_raw(self.status.load(Ordering::SeqCst)) }

    /// Returns the name of the current lifecycle status, for introspection replies.
    #[inline]
    pub fn status_name(&self) -> String { self.status().variant().to_string() }

    /// Returns the start-up error the worker reported, if it did.
    #[inline]
    pub fn notified_error(&self) -> Option<String> { self.notified_error.lock().unwrap().clone() }

    /// Returns how many predict calls completed without errors over this worker's lifetime.
    #[inline]
    pub fn total_normal(&self) -> u64 { self.total_normal.load(Ordering::SeqCst) }

    /// Returns how many predict calls completed with errors over this worker's lifetime.
    #[inline]
    pub fn total_abnormal(&self) -> u64 { self.total_abnormal.load(Ordering::SeqCst) }

    /// Returns how many predict calls are currently in flight to this worker.
    #[inline]
    pub fn in_flight(&self) -> u64 { self.in_flight.load(Ordering::SeqCst) }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("pid", &self.pid)
            .field("address", &self.address)
            .field("repr", &self.repr)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}



#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use specifications::serving::ServableSpec;
    use tokio::sync::mpsc;

    use super::*;

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

    /// Creates a context for a fictive worker together with the receiving end of its event channel.
    fn test_context(pid: u64) -> (WorkerContext, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spec: ServableRegSpec = ServableRegSpec {
            servable_name: "test_servable".into(),
            version_number: 1,
            batch_size: 1,
            methods: vec![MethodInfo { name: "add_common".into(), input_names: vec!["x1".into(), "x2".into()] }],
            own_device: true,
        };
        (WorkerContext::new(pid, Address::hostname("worker", 6000), spec, tx), rx)
    }

    #[tokio::test]
    async fn dispatch_requires_ready() {
        let (ctx, _rx) = test_context(1);
        assert_eq!(ctx.status(), WorkerStatus::Starting);
        let request: PredictRequest = PredictRequest {
            spec: ServableSpec { name: "test_servable".into(), version_number: 1, method_name: "add_common".into() },
            instances: vec![],
        };
        assert!(matches!(ctx.dispatch(request.clone()).await, Err(WorkerCallError::NotReady { pid: 1 })));

        ctx.on_register(Arc::new(NopNotify));
        assert_eq!(ctx.status(), WorkerStatus::Ready);
        // An empty reply counts as abnormal
        ctx.dispatch(request).await.unwrap();
        assert_eq!(ctx.total_abnormal(), 1);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[tokio::test]
    async fn not_available_transition() {
        let (ctx, mut rx) = test_context(42);
        ctx.on_register(Arc::new(NopNotify));
        ctx.notify_not_available();
        ctx.notify_not_available();
        assert_eq!(ctx.status(), WorkerStatus::NotAvailable);
        // Idempotent: only one event made it out
        assert_eq!(rx.recv().await, Some(WorkerEvent::NotAvailable(42)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn not_alive_skipped_after_exit() {
        let (ctx, mut rx) = test_context(7);
        ctx.on_register(Arc::new(NopNotify));
        ctx.on_exit();
        ctx.notify_not_alive();
        assert_eq!(ctx.status(), WorkerStatus::NotifyExit);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_error_is_recorded() {
        let (ctx, _rx) = test_context(9);
        ctx.on_start_error("Could not load model file");
        assert_eq!(ctx.status(), WorkerStatus::NotifyFailed);
        assert_eq!(ctx.notified_error().as_deref(), Some("Could not load model file"));
    }
}
