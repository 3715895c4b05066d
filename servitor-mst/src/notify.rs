//  NOTIFY.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 10:01:27
//  Last edited:
//    31 Jul 2024, 10:31:02
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the `NotifyWorker` trait, which abstracts the RPC stub with
//!   which the master reaches one worker process. The dispatcher core
//!   only ever talks to workers through this seam, so tests can swap the
//!   gRPC stub for an in-process mock.
//

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use specifications::address::Address;
use specifications::serving::{PredictReply, PredictRequest};
use specifications::working::{ExitRequest, PingRequest, WorkerServiceClient, WorkerServiceError};
use tonic::{Request, Status};


/***** LIBRARY *****/
/// Abstracts the master's side of one worker's RPC stub.
#[async_trait]
pub trait NotifyWorker: Send + Sync {
    /// Forwards a (sub-)request to the worker and waits for its reply.
    ///
    /// # Arguments
    /// - `request`: The PredictRequest holding a batch of at most `batch_size` instances.
    ///
    /// # Errors
    /// This function errors if the RPC transport failed. Model-level failures travel inside the reply instead.
    async fn predict(&self, request: PredictRequest) -> Result<PredictReply, Status>;

    /// Asks the worker to exit cleanly.
    ///
    /// # Errors
    /// This function errors if the RPC transport failed.
    async fn exit(&self) -> Result<(), Status>;

    /// Probes the worker for liveness, with the given per-ping deadline.
    ///
    /// # Errors
    /// This function errors if the worker did not answer within the deadline (or the transport failed).
    async fn ping(&self, deadline: Duration) -> Result<(), Status>;
}



/// The [`NotifyWorker`] that reaches a real worker process over gRPC.
#[derive(Clone, Debug)]
pub struct GrpcNotifyWorker {
    /// The address of the worker, also sent along in pings.
    address: Address,
    /// The connected client. Cloned per call, since tonic clients need `&mut self` but share one channel underneath.
    client:  WorkerServiceClient,
}
impl GrpcNotifyWorker {
    /// Constructor for the GrpcNotifyWorker that connects to the given worker.
    ///
    /// # Arguments
    /// - `address`: The address on which the worker's RPC endpoint listens.
    ///
    /// # Errors
    /// This function errors if the connection could not be established.
    pub async fn connect(address: Address) -> Result<Self, WorkerServiceError> {
        debug!("Connecting to worker at '{address}'...");
        let client: WorkerServiceClient = WorkerServiceClient::connect(address.grpc_url()).await?;
        Ok(Self { address, client })
    }
}

#[async_trait]
impl NotifyWorker for GrpcNotifyWorker {
    async fn predict(&self, request: PredictRequest) -> Result<PredictReply, Status> {
        let mut client: WorkerServiceClient = self.client.clone();
        Ok(client.predict(request).await?.into_inner())
    }

    async fn exit(&self) -> Result<(), Status> {
        let mut client: WorkerServiceClient = self.client.clone();
        client.exit(ExitRequest { address: self.address.to_string() }).await?;
        Ok(())
    }

    async fn ping(&self, deadline: Duration) -> Result<(), Status> {
        let mut request: Request<PingRequest> = Request::new(PingRequest { address: self.address.to_string() });
        request.set_timeout(deadline);
        let mut client: WorkerServiceClient = self.client.clone();
        client.ping(request).await?;
        Ok(())
    }
}
