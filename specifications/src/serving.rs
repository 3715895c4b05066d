//  SERVING.rs
//    by Lut99
//
//  Created:
//    14 Mar 2024, 11:20:44
//  Last edited:
//    30 Jul 2024, 17:31:09
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the prost messages of the client-facing predict protocol,
//!   together with the hand-rolled tonic client/server glue for it. Both
//!   the gRPC frontend and the master -> worker predict path speak these
//!   messages.
//

use std::collections::HashMap;
use std::error;
use std::fmt::{Display, Formatter, Result as FResult};
use std::sync::Arc;

use async_trait::async_trait;
use prost::{Enumeration, Message};
use tonic::body::{empty_body, BoxBody};
use tonic::client::Grpc as GrpcClient;
use tonic::codec::ProstCodec;
use tonic::codegen::{http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{Grpc as GrpcServer, NamedService, UnaryService};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};
pub use PredictServiceError as Error;

use crate::tensor;
use crate::tensor::TensorData;


/***** ERRORS *****/
/// Defines the errors occuring in the PredictServiceClient or PredictServiceServer.
#[derive(Debug)]
pub enum PredictServiceError {
    /// Failed to create an endpoint with the given address.
    EndpointError { address: String, err: tonic::transport::Error },
    /// Failed to connect to the given address.
    ConnectError { address: String, err: tonic::transport::Error },
}
impl Display for PredictServiceError {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use PredictServiceError::*;
        match self {
            EndpointError { address, err } => write!(f, "Failed to create a new Endpoint from '{address}': {err}"),
            ConnectError { address, err } => write!(f, "Failed to connect to gRPC endpoint '{address}': {err}"),
        }
    }
}
impl error::Error for PredictServiceError {}

/// Defines the errors occuring when translating wire tensors into [`tensor::Tensor`]s.
#[derive(Debug)]
pub enum TensorConvertError {
    /// The wire carried a dtype discriminant we don't know.
    UnknownDataType { raw: i32 },
    /// The payload did not make for a valid tensor.
    IllegalTensor { err: tensor::TensorError },
}
impl Display for TensorConvertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use TensorConvertError::*;
        match self {
            UnknownDataType { raw } => write!(f, "Unknown tensor data type discriminant {raw}"),
            IllegalTensor { .. } => write!(f, "Wire tensor does not make for a valid tensor"),
        }
    }
}
impl error::Error for TensorConvertError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use TensorConvertError::*;
        match self {
            UnknownDataType { .. } => None,
            IllegalTensor { err } => Some(err),
        }
    }
}





/***** AUXILLARY MESSAGES *****/
/// The status codes carried in [`ErrorMsg`]s.
///
/// `WorkerUnavailable` is reserved: a reply carrying it tells the master to re-route the affected tasks rather than surface the error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    Failed = 1,
    InvalidInputs = 2,
    SystemError = 3,
    WorkerUnavailable = 4,
}

/// The wire-side pendant of [`tensor::DataType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum DataType {
    Unknown = 0,
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Uint8 = 6,
    Uint16 = 7,
    Uint32 = 8,
    Uint64 = 9,
    Float16 = 10,
    Float32 = 11,
    Float64 = 12,
    Bytes = 13,
    String = 14,
}
impl From<tensor::DataType> for DataType {
    fn from(value: tensor::DataType) -> Self {
        match value {
            tensor::DataType::Bool => Self::Bool,
            tensor::DataType::Int8 => Self::Int8,
            tensor::DataType::Int16 => Self::Int16,
            tensor::DataType::Int32 => Self::Int32,
            tensor::DataType::Int64 => Self::Int64,
            tensor::DataType::Uint8 => Self::Uint8,
            tensor::DataType::Uint16 => Self::Uint16,
            tensor::DataType::Uint32 => Self::Uint32,
            tensor::DataType::Uint64 => Self::Uint64,
            tensor::DataType::Float16 => Self::Float16,
            tensor::DataType::Float32 => Self::Float32,
            tensor::DataType::Float64 => Self::Float64,
            tensor::DataType::Bytes => Self::Bytes,
            tensor::DataType::String => Self::String,
        }
    }
}
impl TryFrom<DataType> for tensor::DataType {
    type Error = TensorConvertError;

    fn try_from(value: DataType) -> Result<Self, Self::Error> {
        match value {
            DataType::Unknown => Err(TensorConvertError::UnknownDataType { raw: 0 }),
            DataType::Bool => Ok(Self::Bool),
            DataType::Int8 => Ok(Self::Int8),
            DataType::Int16 => Ok(Self::Int16),
            DataType::Int32 => Ok(Self::Int32),
            DataType::Int64 => Ok(Self::Int64),
            DataType::Uint8 => Ok(Self::Uint8),
            DataType::Uint16 => Ok(Self::Uint16),
            DataType::Uint32 => Ok(Self::Uint32),
            DataType::Uint64 => Ok(Self::Uint64),
            DataType::Float16 => Ok(Self::Float16),
            DataType::Float32 => Ok(Self::Float32),
            DataType::Float64 => Ok(Self::Float64),
            DataType::Bytes => Ok(Self::Bytes),
            DataType::String => Ok(Self::String),
        }
    }
}

/// A (per-instance or request-wide) error as it travels the wire.
#[derive(Clone, Message)]
pub struct ErrorMsg {
    /// The status code; 0 means success.
    #[prost(tag = "1", required, int32)]
    pub error_code: i32,
    /// A human-readable description of what went wrong.
    #[prost(tag = "2", required, string)]
    pub error_msg:  String,
}
impl ErrorMsg {
    /// Constructor for an ErrorMsg that means "all is well".
    #[inline]
    pub fn ok() -> Self { Self { error_code: StatusCode::Success as i32, error_msg: String::new() } }

    /// Constructor for an ErrorMsg with the given code and message.
    #[inline]
    pub fn new(code: StatusCode, msg: impl Into<String>) -> Self { Self { error_code: code as i32, error_msg: msg.into() } }

    /// Returns whether this ErrorMsg denotes success.
    #[inline]
    pub fn is_ok(&self) -> bool { self.error_code == StatusCode::Success as i32 }

    /// Returns the typed status code, if the discriminant is a known one.
    #[inline]
    pub fn code(&self) -> Option<StatusCode> { StatusCode::try_from(self.error_code).ok() }
}





/***** MESSAGES *****/
/// Identifies the (servable, version, method) triplet a request is aimed at.
#[derive(Clone, Message)]
pub struct ServableSpec {
    /// The name of the servable.
    #[prost(tag = "1", required, string)]
    pub name: String,
    /// The requested version; 0 means "the latest registered version".
    #[prost(tag = "2", required, uint64)]
    pub version_number: u64,
    /// The method of the servable to call.
    #[prost(tag = "3", required, string)]
    pub method_name: String,
}
impl ServableSpec {
    /// Formats this spec the way it shows up in error messages and logs.
    #[inline]
    pub fn repr(&self) -> String {
        format!("servable name: {}, method name: {}, version number: {}", self.name, self.method_name, self.version_number)
    }
}

/// The shape of a tensor.
#[derive(Clone, Message)]
pub struct Shape {
    /// The dimensions, outermost first.
    #[prost(tag = "1", repeated, int64)]
    pub dims: Vec<i64>,
}

/// A tensor as it travels the wire.
///
/// Numeric dtypes pack little-endian elements into `data`; `bytes`/`string` dtypes fill `bytes_val` with one entry per element and leave `data`
/// empty.
#[derive(Clone, Message)]
pub struct Tensor {
    /// The element type, as a [`DataType`] discriminant.
    #[prost(tag = "1", required, enumeration = "DataType")]
    pub dtype: i32,
    /// The shape of the tensor.
    #[prost(tag = "2", required, message)]
    pub shape: Shape,
    /// The packed little-endian payload for numeric dtypes.
    #[prost(tag = "3", bytes = "vec")]
    pub data:  Vec<u8>,
    /// The per-element payload for `bytes`/`string` dtypes.
    #[prost(tag = "4", repeated, bytes = "vec")]
    pub bytes_val: Vec<Vec<u8>>,
}
impl From<tensor::Tensor> for Tensor {
    fn from(value: tensor::Tensor) -> Self {
        let (dtype, dims, data): (tensor::DataType, Vec<i64>, TensorData) = value.into_parts();
        match data {
            TensorData::Packed(data) => Self { dtype: DataType::from(dtype) as i32, shape: Shape { dims }, data, bytes_val: vec![] },
            TensorData::Elements(bytes_val) => Self { dtype: DataType::from(dtype) as i32, shape: Shape { dims }, data: vec![], bytes_val },
        }
    }
}
impl TryFrom<Tensor> for tensor::Tensor {
    type Error = TensorConvertError;

    fn try_from(value: Tensor) -> Result<Self, Self::Error> {
        let dtype: tensor::DataType = match DataType::try_from(value.dtype) {
            Ok(dtype) => tensor::DataType::try_from(dtype)?,
            Err(_) => {
                return Err(TensorConvertError::UnknownDataType { raw: value.dtype });
            },
        };
        let res: Result<Self, tensor::TensorError> = if dtype.is_packed() {
            Self::new_packed(dtype, value.shape.dims, value.data)
        } else {
            Self::new_elements(dtype, value.shape.dims, value.bytes_val)
        };
        res.map_err(|err| TensorConvertError::IllegalTensor { err })
    }
}

/// One logical sample inside a predict request: a mapping of input names to tensors.
#[derive(Clone, Message)]
pub struct Instance {
    /// The tensors of this instance, keyed by input name.
    #[prost(tag = "1", map = "string, message")]
    pub items: HashMap<String, Tensor>,
}

/// Request for running the instances through a method of a servable.
#[derive(Clone, Message)]
pub struct PredictRequest {
    /// The servable/version/method to run against.
    #[prost(tag = "1", required, message)]
    pub spec: ServableSpec,
    /// The samples to process. Order is significant; reply instances align by index.
    #[prost(tag = "2", repeated, message)]
    pub instances: Vec<Instance>,
}

/// The reply to a [`PredictRequest`].
///
/// Either array may be empty: an empty `error_msg` means every instance succeeded, while an empty `instances` together with a single `error_msg`
/// entry means the request failed as a whole.
#[derive(Clone, Message)]
pub struct PredictReply {
    /// The spec of the request this is a reply to.
    #[prost(tag = "1", required, message)]
    pub spec: ServableSpec,
    /// The per-instance outputs, aligned with the request's instances.
    #[prost(tag = "2", repeated, message)]
    pub instances: Vec<Instance>,
    /// The per-instance errors (or a single request-wide one).
    #[prost(tag = "3", repeated, message)]
    pub error_msg: Vec<ErrorMsg>,
}
impl PredictReply {
    /// Constructor for a PredictReply that fails the whole request with one error.
    #[inline]
    pub fn failed(spec: ServableSpec, code: StatusCode, msg: impl Into<String>) -> Self {
        Self { spec, instances: vec![], error_msg: vec![ErrorMsg::new(code, msg)] }
    }

    /// Returns whether any error in this reply carries the given status code.
    #[inline]
    pub fn has_code(&self, code: StatusCode) -> bool { self.error_msg.iter().any(|e| e.error_code == code as i32) }
}





/***** SERVICES *****/
/// The PredictServiceClient can connect to a remote server implementing the PredictService protocol.
#[derive(Debug, Clone)]
pub struct PredictServiceClient {
    /// The client with which we actually do everything
    client: GrpcClient<Channel>,
}

impl PredictServiceClient {
    /// Attempts to connect to the remote endpoint.
    ///
    /// # Arguments
    /// - `address`: The address of the remote endpoint to connect to.
    ///
    /// # Returns
    /// A new PredictServiceClient instance that is connected to the remote endpoint.
    ///
    /// # Errors
    /// This function errors if the connection could not be established for whatever reason.
    pub async fn connect(address: impl Into<String>) -> Result<Self, Error> {
        let address: String = address.into();

        // Attempt to make the connection
        let conn: Channel = match Endpoint::new(address.clone()) {
            Ok(endpoint) => match endpoint.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    return Err(Error::ConnectError { address, err });
                },
            },
            Err(err) => {
                return Err(Error::EndpointError { address, err });
            },
        };

        // Store it internally
        Ok(Self { client: GrpcClient::new(conn) })
    }

    /// Send a PredictRequest to the connected endpoint.
    ///
    /// # Arguments
    /// - `request`: The PredictRequest to send to the endpoint.
    ///
    /// # Returns
    /// The PredictReply the endpoint returns.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the endpoint itself failed to process it.
    pub async fn predict(&mut self, request: impl tonic::IntoRequest<PredictRequest>) -> Result<Response<PredictReply>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/serving.PredictService/Predict");
        self.client.unary(request.into_request(), path, codec).await
    }
}



/// The PredictService, which is a trait for easily writing a service for the predict protocol.
///
/// Implementation based on the auto-generated version from tonic.
#[async_trait]
pub trait PredictService: 'static + Send + Sync {
    /// Handle for when a PredictRequest comes in.
    ///
    /// # Arguments
    /// - `request`: The (`tonic::Request`-wrapped) PredictRequest containing the relevant details.
    ///
    /// # Returns
    /// A PredictReply for this request, wrapped in a `tonic::Response`.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn predict(&self, request: Request<PredictRequest>) -> Result<Response<PredictReply>, Status>;
}

/// The PredictServiceServer hosts the server part of the PredictService protocol.
#[derive(Debug)]
pub struct PredictServiceServer<T> {
    /// The service that we host.
    service: Arc<T>,
}

impl<T> PredictServiceServer<T> {
    /// Constructor for the PredictServiceServer.
    ///
    /// # Arguments
    /// - `service`: The Service to serve.
    ///
    /// # Returns
    /// A new PredictServiceServer instance.
    #[inline]
    pub fn new(service: T) -> Self { Self { service: Arc::new(service) } }
}

impl<T: PredictService, B> Service<http::Request<B>> for PredictServiceServer<T>
where
    T: PredictService,
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
            "/serving.PredictService/Predict" => {
                /// Helper struct for the given PredictService that focusses specifically on this request.
                struct PredictSvc<T>(Arc<T>);
                impl<T: PredictService> UnaryService<PredictRequest> for PredictSvc<T> {
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

impl<T: Clone> Clone for PredictServiceServer<T> {
    #[inline]
    fn clone(&self) -> Self { Self { service: self.service.clone() } }
}
impl<T: PredictService> NamedService for PredictServiceServer<T> {
    const NAME: &'static str = "serving.PredictService";
}
