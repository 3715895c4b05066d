//  WORKING.rs
//    by Lut99
//
//  Created:
//    14 Mar 2024, 13:02:31
//  Last edited:
//    30 Jul 2024, 17:58:45
//  Auto updated?
//    Yes
//
//  Description:
//!   Contains prost messages for interacting between master and workers.
//!   The `WorkerService` is hosted by every worker process and called by
//!   the master; the `MasterService` is hosted by the master and called
//!   by workers (registration, exit, failure notification, answering
//!   liveness probes) and by introspection tooling.
//

use std::error;
use std::fmt::{Display, Formatter, Result as FResult};
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tonic::body::{empty_body, BoxBody};
use tonic::client::Grpc as GrpcClient;
use tonic::codec::ProstCodec;
use tonic::codegen::{http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{Grpc as GrpcServer, NamedService, UnaryService};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};

use crate::serving::{ErrorMsg, PredictReply, PredictRequest};


/***** ERRORS *****/
/// Defines the errors occuring in the WorkerServiceClient or WorkerServiceServer.
#[derive(Debug)]
pub enum WorkerServiceError {
    /// Failed to create an endpoint with the given address.
    EndpointError { address: String, err: tonic::transport::Error },
    /// Failed to connect to the given address.
    ConnectError { address: String, err: tonic::transport::Error },
}
impl Display for WorkerServiceError {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use WorkerServiceError::*;
        match self {
            EndpointError { address, err } => write!(f, "Failed to create a new Endpoint from '{address}': {err}"),
            ConnectError { address, err } => write!(f, "Failed to connect to gRPC endpoint '{address}': {err}"),
        }
    }
}
impl error::Error for WorkerServiceError {}

/// Defines the errors occuring in the MasterServiceClient or MasterServiceServer.
#[derive(Debug)]
pub enum MasterServiceError {
    /// Failed to create an endpoint with the given address.
    EndpointError { address: String, err: tonic::transport::Error },
    /// Failed to connect to the given address.
    ConnectError { address: String, err: tonic::transport::Error },
}
impl Display for MasterServiceError {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use MasterServiceError::*;
        match self {
            EndpointError { address, err } => write!(f, "Failed to create a new Endpoint from '{address}': {err}"),
            ConnectError { address, err } => write!(f, "Failed to connect to gRPC endpoint '{address}': {err}"),
        }
    }
}
impl error::Error for MasterServiceError {}





/***** AUXILLARY MESSAGES *****/
/// Describes one method of a servable as a worker declares it.
#[derive(Clone, Message)]
pub struct MethodInfo {
    /// The name of the method.
    #[prost(tag = "1", required, string)]
    pub name: String,
    /// The input names every request instance must provide for this method.
    #[prost(tag = "2", repeated, string)]
    pub input_names: Vec<String>,
}

/// Describes the servable a worker hosts.
#[derive(Clone, Message)]
pub struct ServableRegSpec {
    /// The name of the servable.
    #[prost(tag = "1", required, string)]
    pub servable_name: String,
    /// The version of the servable this worker hosts.
    #[prost(tag = "2", required, uint64)]
    pub version_number: u64,
    /// The maximum number of instances the worker accepts in one predict call.
    #[prost(tag = "3", required, uint64)]
    pub batch_size: u64,
    /// The methods the worker supports.
    #[prost(tag = "4", repeated, message)]
    pub methods: Vec<MethodInfo>,
    /// Whether the worker owns a device. CPU-only helper workers set this to false; they only receive methods with at least one non-model stage.
    #[prost(tag = "5", required, bool)]
    pub own_device: bool,
}
impl ServableRegSpec {
    /// Formats this spec the way it shows up in error messages and logs.
    #[inline]
    pub fn repr(&self) -> String { format!("servable name: {}, version number: {}", self.servable_name, self.version_number) }
}

/// Describes a worker process as a whole upon registration.
#[derive(Clone, Message)]
pub struct WorkerRegSpec {
    /// The address on which the worker's [`WorkerService`] may be reached.
    #[prost(tag = "1", required, string)]
    pub worker_address: String,
    /// The OS process identifier of the worker.
    #[prost(tag = "2", required, uint64)]
    pub worker_pid: u64,
    /// The servable the worker hosts.
    #[prost(tag = "3", required, message)]
    pub servable_spec: ServableRegSpec,
}





/***** MESSAGES *****/
/// Request with which a worker announces itself to the master.
#[derive(Clone, Message)]
pub struct RegisterRequest {
    /// Everything the master needs to know about the worker.
    #[prost(tag = "1", required, message)]
    pub spec: WorkerRegSpec,
}

/// The reply sent by the master when a worker has registered.
#[derive(Clone, Message)]
pub struct RegisterReply {
    /// What went wrong, if anything did.
    #[prost(tag = "1", message)]
    pub error: Option<ErrorMsg>,
}



/// Request for a clean goodbye, in either direction.
#[derive(Clone, Message)]
pub struct ExitRequest {
    /// The address of the party that is leaving.
    #[prost(tag = "1", required, string)]
    pub address: String,
}

/// The reply to an [`ExitRequest`].
#[derive(Clone, Message)]
pub struct ExitReply {}



/// Request with which a worker reports that it failed to start or crashed.
#[derive(Clone, Message)]
pub struct NotifyFailedRequest {
    /// The OS process identifier of the failing worker.
    #[prost(tag = "1", required, uint64)]
    pub worker_pid: u64,
    /// A description of what went wrong.
    #[prost(tag = "2", required, string)]
    pub error_msg:  String,
}

/// The reply to a [`NotifyFailedRequest`].
#[derive(Clone, Message)]
pub struct NotifyFailedReply {}



/// Request for introspecting a servable registered at the master.
#[derive(Clone, Message)]
pub struct GetModelInfoRequest {
    /// The servable to inspect.
    #[prost(tag = "1", required, string)]
    pub servable_name: String,
    /// The version to inspect; 0 means "the latest registered version".
    #[prost(tag = "2", required, uint64)]
    pub version_number: u64,
}

/// Describes one registered worker in a [`GetModelInfoReply`].
#[derive(Clone, Message)]
pub struct WorkerInfo {
    /// The OS process identifier of the worker.
    #[prost(tag = "1", required, uint64)]
    pub pid: u64,
    /// The address of the worker.
    #[prost(tag = "2", required, string)]
    pub address: String,
    /// The current lifecycle status of the worker.
    #[prost(tag = "3", required, string)]
    pub status: String,
    /// How many predict calls this worker completed without errors.
    #[prost(tag = "4", required, uint64)]
    pub total_normal: u64,
    /// How many predict calls this worker completed with errors.
    #[prost(tag = "5", required, uint64)]
    pub total_abnormal: u64,
    /// Whether the worker owns a device.
    #[prost(tag = "6", required, bool)]
    pub own_device: bool,
}

/// The reply to a [`GetModelInfoRequest`].
#[derive(Clone, Message)]
pub struct GetModelInfoReply {
    /// What went wrong, if anything did.
    #[prost(tag = "1", message)]
    pub error: Option<ErrorMsg>,
    /// The name of the inspected servable.
    #[prost(tag = "2", required, string)]
    pub servable_name: String,
    /// The resolved version of the inspected servable.
    #[prost(tag = "3", required, uint64)]
    pub version_number: u64,
    /// The batch size the servable's workers declared.
    #[prost(tag = "4", required, uint64)]
    pub batch_size: u64,
    /// The methods of the servable, with their input signatures.
    #[prost(tag = "5", repeated, message)]
    pub methods: Vec<MethodInfo>,
    /// The workers currently registered under the servable.
    #[prost(tag = "6", repeated, message)]
    pub workers: Vec<WorkerInfo>,
}



/// A liveness probe.
#[derive(Clone, Message)]
pub struct PingRequest {
    /// The address of the sending party.
    #[prost(tag = "1", required, string)]
    pub address: String,
}

/// The reply to a [`PingRequest`].
#[derive(Clone, Message)]
pub struct PingReply {}



/// An out-of-band answer to a liveness probe, sent by the probed party on its own connection.
#[derive(Clone, Message)]
pub struct PongRequest {
    /// The address of the answering party, i.e., the address the probe was sent to.
    #[prost(tag = "1", required, string)]
    pub address: String,
}

/// The reply to a [`PongRequest`].
#[derive(Clone, Message)]
pub struct PongReply {}





/***** WORKER SERVICE *****/
/// The WorkerServiceClient can connect to a remote server implementing the WorkerService protocol (i.e., a worker process).
#[derive(Debug, Clone)]
pub struct WorkerServiceClient {
    /// The client with which we actually do everything
    client: GrpcClient<Channel>,
}

impl WorkerServiceClient {
    /// Attempts to connect to the remote endpoint.
    ///
    /// # Arguments
    /// - `address`: The address of the remote endpoint to connect to.
    ///
    /// # Returns
    /// A new WorkerServiceClient instance that is connected to the remote endpoint.
    ///
    /// # Errors
    /// This function errors if the connection could not be established for whatever reason.
    pub async fn connect(address: impl Into<String>) -> Result<Self, WorkerServiceError> {
        let address: String = address.into();

        // Attempt to make the connection
        let conn: Channel = match Endpoint::new(address.clone()) {
            Ok(endpoint) => match endpoint.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    return Err(WorkerServiceError::ConnectError { address, err });
                },
            },
            Err(err) => {
                return Err(WorkerServiceError::EndpointError { address, err });
            },
        };

        // Store it internally
        Ok(Self { client: GrpcClient::new(conn) })
    }

    /// Send a PredictRequest to the connected worker.
    ///
    /// # Arguments
    /// - `request`: The PredictRequest to send to the worker.
    ///
    /// # Returns
    /// The PredictReply the worker returns.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the worker itself failed to process it.
    pub async fn predict(&mut self, request: impl tonic::IntoRequest<PredictRequest>) -> Result<Response<PredictReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.WorkerService/Predict");
        self.client.unary(request.into_request(), path, codec).await
    }

    /// Asks the connected worker to exit cleanly.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the worker itself failed to process it.
    pub async fn exit(&mut self, request: impl tonic::IntoRequest<ExitRequest>) -> Result<Response<ExitReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.WorkerService/Exit");
        self.client.unary(request.into_request(), path, codec).await
    }

    /// Probes the connected worker for liveness.
    ///
    /// Note that callers typically wrap the request in a [`tonic::Request`] with an explicit timeout, so a dead peer shows up as a deadline
    /// error instead of hanging the probe.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the deadline expired.
    pub async fn ping(&mut self, request: impl tonic::IntoRequest<PingRequest>) -> Result<Response<PingReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.WorkerService/Ping");
        self.client.unary(request.into_request(), path, codec).await
    }
}



/// The WorkerService, which is a trait for easily writing the service hosted by a worker process.
///
/// Implementation based on the auto-generated version from tonic. The master only consumes this protocol; worker binaries (and mock workers in
/// tests) implement it.
#[async_trait]
pub trait WorkerService: 'static + Send + Sync {
    /// Handle for when a PredictRequest comes in.
    ///
    /// # Arguments
    /// - `request`: The (`tonic::Request`-wrapped) PredictRequest containing a batch of at most `batch_size` instances.
    ///
    /// # Returns
    /// A PredictReply for this batch, wrapped in a `tonic::Response`.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn predict(&self, request: Request<PredictRequest>) -> Result<Response<PredictReply>, Status>;

    /// Handle for when the master asks this worker to exit.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn exit(&self, request: Request<ExitRequest>) -> Result<Response<ExitReply>, Status>;

    /// Handle for when the master probes this worker for liveness.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status>;
}

/// The WorkerServiceServer hosts the server part of the WorkerService protocol.
#[derive(Debug)]
pub struct WorkerServiceServer<T> {
    /// The service that we host.
    service: Arc<T>,
}

impl<T> WorkerServiceServer<T> {
    /// Constructor for the WorkerServiceServer.
    ///
    /// # Arguments
    /// - `service`: The Service to serve.
    ///
    /// # Returns
    /// A new WorkerServiceServer instance.
    #[inline]
    pub fn new(service: T) -> Self { Self { service: Arc::new(service) } }
}

impl<T: WorkerService, B> Service<http::Request<B>> for WorkerServiceServer<T>
where
    T: WorkerService,
    B: 'static + Send + Body,
    B::Error: 'static + Send + Into<StdError>,
{
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;
    type Response = http::Response<BoxBody>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> { Poll::Ready(Ok(())) }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            // Incoming PredictRequest
            "/serving.WorkerService/Predict" => {
                /// Helper struct for the given WorkerService that focusses specifically on this request.
                struct PredictSvc<T>(Arc<T>);
                impl<T: WorkerService> UnaryService<PredictRequest> for PredictSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = PredictReply;

                    fn call(&mut self, req: Request<PredictRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).predict(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: PredictSvc<T> = PredictSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Incoming ExitRequest
            "/serving.WorkerService/Exit" => {
                /// Helper struct for the given WorkerService that focusses specifically on this request.
                struct ExitSvc<T>(Arc<T>);
                impl<T: WorkerService> UnaryService<ExitRequest> for ExitSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = ExitReply;

                    fn call(&mut self, req: Request<ExitRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).exit(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: ExitSvc<T> = ExitSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Incoming PingRequest
            "/serving.WorkerService/Ping" => {
                /// Helper struct for the given WorkerService that focusses specifically on this request.
                struct PingSvc<T>(Arc<T>);
                impl<T: WorkerService> UnaryService<PingRequest> for PingSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = PingReply;

                    fn call(&mut self, req: Request<PingRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).ping(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: PingSvc<T> = PingSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Other (boring) request types
            _ => {
                // Return a future that simply does ¯\_(ツ)_/¯
                Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap())
                })
            },
        }
    }
}

impl<T: Clone> Clone for WorkerServiceServer<T> {
    #[inline]
    fn clone(&self) -> Self { Self { service: self.service.clone() } }
}
impl<T: WorkerService> NamedService for WorkerServiceServer<T> {
    const NAME: &'static str = "serving.WorkerService";
}





/***** MASTER SERVICE *****/
/// The MasterServiceClient can connect to a remote server implementing the MasterService protocol (i.e., the serving master). Worker processes
/// use it to register, to say goodbye and to answer the master's liveness probes.
#[derive(Debug, Clone)]
pub struct MasterServiceClient {
    /// The client with which we actually do everything
    client: GrpcClient<Channel>,
}

impl MasterServiceClient {
    /// Attempts to connect to the remote endpoint.
    ///
    /// # Arguments
    /// - `address`: The address of the remote endpoint to connect to.
    ///
    /// # Returns
    /// A new MasterServiceClient instance that is connected to the remote endpoint.
    ///
    /// # Errors
    /// This function errors if the connection could not be established for whatever reason.
    pub async fn connect(address: impl Into<String>) -> Result<Self, MasterServiceError> {
        let address: String = address.into();

        // Attempt to make the connection
        let conn: Channel = match Endpoint::new(address.clone()) {
            Ok(endpoint) => match endpoint.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    return Err(MasterServiceError::ConnectError { address, err });
                },
            },
            Err(err) => {
                return Err(MasterServiceError::EndpointError { address, err });
            },
        };

        // Store it internally
        Ok(Self { client: GrpcClient::new(conn) })
    }

    /// Registers a worker with the connected master.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the master itself failed to process it.
    pub async fn register(&mut self, request: impl tonic::IntoRequest<RegisterRequest>) -> Result<Response<RegisterReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.MasterService/Register");
        self.client.unary(request.into_request(), path, codec).await
    }

    /// Unregisters a worker from the connected master.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the master itself failed to process it.
    pub async fn exit(&mut self, request: impl tonic::IntoRequest<ExitRequest>) -> Result<Response<ExitReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.MasterService/Exit");
        self.client.unary(request.into_request(), path, codec).await
    }

    /// Reports a worker start-up failure to the connected master.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the master itself failed to process it.
    pub async fn notify_failed(&mut self, request: impl tonic::IntoRequest<NotifyFailedRequest>) -> Result<Response<NotifyFailedReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.MasterService/NotifyFailed");
        self.client.unary(request.into_request(), path, codec).await
    }

    /// Queries the connected master for the signature of a registered servable.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the master itself failed to process it.
    pub async fn get_model_info(&mut self, request: impl tonic::IntoRequest<GetModelInfoRequest>) -> Result<Response<GetModelInfoReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.MasterService/GetModelInfo");
        self.client.unary(request.into_request(), path, codec).await
    }

    /// Answers one of the master's liveness probes, on the worker's own connection.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the master itself failed to process it.
    pub async fn pong(&mut self, request: impl tonic::IntoRequest<PongRequest>) -> Result<Response<PongReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.MasterService/Pong");
        self.client.unary(request.into_request(), path, codec).await
    }
}



/// The MasterService, which is a trait for easily writing the worker-facing side of the serving master.
///
/// Implementation based on the auto-generated version from tonic.
#[async_trait]
pub trait MasterService: 'static + Send + Sync {
    /// Handle for when a worker announces itself.
    ///
    /// # Arguments
    /// - `request`: The (`tonic::Request`-wrapped) RegisterRequest describing the worker and its servable.
    ///
    /// # Returns
    /// A RegisterReply for this request, wrapped in a `tonic::Response`. Registration errors travel in the reply's `error` field so the worker
    /// can log them properly.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterReply>, Status>;

    /// Handle for when a worker says a clean goodbye.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn exit(&self, request: Request<ExitRequest>) -> Result<Response<ExitReply>, Status>;

    /// Handle for when a worker reports it failed to start.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn notify_failed(&self, request: Request<NotifyFailedRequest>) -> Result<Response<NotifyFailedReply>, Status>;

    /// Handle for introspection requests about a registered servable.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn get_model_info(&self, request: Request<GetModelInfoRequest>) -> Result<Response<GetModelInfoReply>, Status>;

    /// Handle for when a worker answers one of the master's liveness probes out-of-band.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn pong(&self, request: Request<PongRequest>) -> Result<Response<PongReply>, Status>;
}

/// The MasterServiceServer hosts the server part of the MasterService protocol.
#[derive(Debug)]
pub struct MasterServiceServer<T> {
    /// The service that we host.
    service: Arc<T>,
}

impl<T> MasterServiceServer<T> {
    /// Constructor for the MasterServiceServer.
    ///
    /// # Arguments
    /// - `service`: The Service to serve.
    ///
    /// # Returns
    /// A new MasterServiceServer instance.
    #[inline]
    pub fn new(service: T) -> Self { Self { service: Arc::new(service) } }
}

impl<T: MasterService, B> Service<http::Request<B>> for MasterServiceServer<T>
where
    T: MasterService,
    B: 'static + Send + Body,
    B::Error: 'static + Send + Into<StdError>,
{
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;
    type Response = http::Response<BoxBody>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> { Poll::Ready(Ok(())) }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            // Incoming RegisterRequest
            "/serving.MasterService/Register" => {
                /// Helper struct for the given MasterService that focusses specifically on this request.
                struct RegisterSvc<T>(Arc<T>);
                impl<T: MasterService> UnaryService<RegisterRequest> for RegisterSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = RegisterReply;

                    fn call(&mut self, req: Request<RegisterRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).register(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: RegisterSvc<T> = RegisterSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Incoming ExitRequest
            "/serving.MasterService/Exit" => {
                /// Helper struct for the given MasterService that focusses specifically on this request.
                struct ExitSvc<T>(Arc<T>);
                impl<T: MasterService> UnaryService<ExitRequest> for ExitSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = ExitReply;

                    fn call(&mut self, req: Request<ExitRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).exit(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: ExitSvc<T> = ExitSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Incoming NotifyFailedRequest
            "/serving.MasterService/NotifyFailed" => {
                /// Helper struct for the given MasterService that focusses specifically on this request.
                struct NotifyFailedSvc<T>(Arc<T>);
                impl<T: MasterService> UnaryService<NotifyFailedRequest> for NotifyFailedSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = NotifyFailedReply;

                    fn call(&mut self, req: Request<NotifyFailedRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).notify_failed(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: NotifyFailedSvc<T> = NotifyFailedSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Incoming GetModelInfoRequest
            "/serving.MasterService/GetModelInfo" => {
                /// Helper struct for the given MasterService that focusses specifically on this request.
                struct GetModelInfoSvc<T>(Arc<T>);
                impl<T: MasterService> UnaryService<GetModelInfoRequest> for GetModelInfoSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = GetModelInfoReply;

                    fn call(&mut self, req: Request<GetModelInfoRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).get_model_info(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: GetModelInfoSvc<T> = GetModelInfoSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Incoming PongRequest
            "/serving.MasterService/Pong" => {
                /// Helper struct for the given MasterService that focusses specifically on this request.
                struct PongSvc<T>(Arc<T>);
                impl<T: MasterService> UnaryService<PongRequest> for PongSvc<T> {
                    type Future = BoxFuture<Response<Self::Response>, Status>;
                    type Response = PongReply;

                    fn call(&mut self, req: Request<PongRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).pong(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: PongSvc<T> = PongSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.unary(method, req).await)
                })
            },

            // Other (boring) request types
            _ => {
                // Return a future that simply does ¯\_(ツ)_/¯
                Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap())
                })
            },
        }
    }
}

impl<T: Clone> Clone for MasterServiceServer<T> {
    #[inline]
    fn clone(&self) -> Self { Self { service: self.service.clone() } }
}
impl<T: MasterService> NamedService for MasterServiceServer<T> {
    const NAME: &'static str = "serving.MasterService";
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_spec_roundtrip() {
        let spec: WorkerRegSpec = WorkerRegSpec {
            worker_address: "127.0.0.1:6200".into(),
            worker_pid: 4221,
            servable_spec: ServableRegSpec {
                servable_name: "test_servable".into(),
                version_number: 1,
                batch_size: 8,
                methods: vec![MethodInfo { name: "add_common".into(), input_names: vec!["x1".into(), "x2".into()] }],
                own_device: true,
            },
        };
        let buf: Vec<u8> = spec.encode_to_vec();
        let back: WorkerRegSpec = WorkerRegSpec::decode(buf.as_slice()).unwrap();
        assert_eq!(back.worker_pid, 4221);
        assert_eq!(back.servable_spec.methods.len(), 1);
        assert_eq!(back.servable_spec.methods[0].input_names, vec!["x1".to_string(), "x2".to_string()]);
    }
}
