//  ERRORS.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 09:33:10
//  Last edited:
//    31 Jul 2024, 10:22:30
//  Auto updated?
//    Yes
//
//  Description:
//!   Contains errors used within the `servitor-mst` package only.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};

use specifications::address::AddressError;
use specifications::serving::{ErrorMsg, StatusCode};
use specifications::tensor::{DataType, TensorError};
use specifications::working::WorkerServiceError;


/***** ERRORS *****/
/// Defines errors that occur when dispatching a predict request.
///
/// Every variant maps onto one of the wire [`StatusCode`]s, so it can travel back to the client as an [`ErrorMsg`].
#[derive(Debug)]
pub enum DispatchError {
    /// No endpoint (or no live worker) serves the requested servable/version.
    ServableNotAvailable { repr: String },
    /// The endpoint exists, but does not know the requested method.
    MethodNotAvailable { repr: String },
    /// An instance misses one of the inputs the method requires.
    MissingInput { repr: String, instance: usize, input: String },
    /// The per-method scheduler for a declared method went missing.
    NoModelThread { method: String },
    /// The admission cap was reached.
    TooManyRequests { limit: u32 },
    /// A worker replied with a different number of instances than it was sent.
    ReplyCountMismatch { expected: usize, got: usize },
    /// A worker was added twice to the same method scheduler.
    WorkerExists { pid: u64 },
}
impl DispatchError {
    /// Returns the wire status code this error maps onto.
    #[inline]
    pub fn code(&self) -> StatusCode {
        use DispatchError::*;
        match self {
            ServableNotAvailable { .. } | MethodNotAvailable { .. } | MissingInput { .. } => StatusCode::InvalidInputs,
            NoModelThread { .. } => StatusCode::Failed,
            TooManyRequests { .. } | ReplyCountMismatch { .. } | WorkerExists { .. } => StatusCode::SystemError,
        }
    }

    /// Renders this error as the [`ErrorMsg`] that travels back to the client.
    #[inline]
    pub fn to_error_msg(&self) -> ErrorMsg { ErrorMsg::new(self.code(), self.to_string()) }
}
impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use DispatchError::*;
        match self {
            ServableNotAvailable { repr } => write!(f, "Request {repr}, servable is not available"),
            MethodNotAvailable { repr } => write!(f, "Request {repr}, method is not available"),
            MissingInput { repr, instance, input } => write!(f, "Request {repr}, cannot find input '{input}' in instance {instance}"),
            NoModelThread { method } => write!(f, "Cannot find model thread of method {method}"),
            TooManyRequests { limit } => write!(f, "Too many requests pending, soft cap is {limit}"),
            ReplyCountMismatch { expected, got } => write!(f, "The instance count {got} of reply is not equal to the count {expected} of request"),
            WorkerExists { pid } => write!(f, "Worker with pid {pid} already takes part in this method"),
        }
    }
}
impl Error for DispatchError {}



/// Defines errors that occur when calling a single worker over its RPC stub.
#[derive(Debug)]
pub enum WorkerCallError {
    /// The worker is not in the `Ready` state (or its stub is already gone).
    NotReady { pid: u64 },
    /// The RPC itself failed.
    Rpc { pid: u64, err: tonic::Status },
}
impl Display for WorkerCallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use WorkerCallError::*;
        match self {
            NotReady { pid } => write!(f, "Worker {pid} is not ready"),
            Rpc { pid, err } => write!(f, "Predict call to worker {pid} failed: {err}"),
        }
    }
}
impl Error for WorkerCallError {}



/// Defines errors that occur while (un)registering workers.
#[derive(Debug)]
pub enum RegistryError {
    /// The worker announced an address we cannot parse.
    IllegalAddress { raw: String, err: AddressError },
    /// A worker with this address is already registered.
    DuplicateAddress { address: String },
    /// The worker declared a batch size of 0.
    BatchSizeZero { repr: String },
    /// The worker declared a different method set than the endpoint it joins.
    IncompatibleMethods { repr: String, address: String },
    /// The worker declared a different batch size than the endpoint it joins.
    IncompatibleBatchSize { repr: String, expected: u64, got: u64 },
    /// Failed to connect to the worker's RPC endpoint.
    ConnectError { address: String, err: WorkerServiceError },
    /// The given address does not belong to any registered worker.
    UnknownWorker { address: String },
    /// The given pid does not belong to any registered worker.
    UnknownPid { pid: u64 },
    /// The given servable (or version of it) is not registered.
    UnknownServable { name: String, version_number: u64 },
}
impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use RegistryError::*;
        match self {
            IllegalAddress { raw, .. } => write!(f, "Cannot parse worker address '{raw}'"),
            DuplicateAddress { address } => write!(f, "A worker with address '{address}' is already registered"),
            BatchSizeZero { repr } => write!(f, "Register worker, {repr}: batch size should be greater than 0"),
            IncompatibleMethods { repr, address } => {
                write!(f, "Worker '{address}' declares a different method set than registered before for {repr}")
            },
            IncompatibleBatchSize { repr, expected, got } => {
                write!(f, "Worker declares batch size {got} but {repr} was registered with batch size {expected}")
            },
            ConnectError { address, .. } => write!(f, "Failed to connect to worker at '{address}'"),
            UnknownWorker { address } => write!(f, "No worker with address '{address}' is registered"),
            UnknownPid { pid } => write!(f, "No worker with pid {pid} is registered"),
            UnknownServable { name, version_number } => {
                write!(f, "Servable '{name}' (version {version_number}) is not registered")
            },
        }
    }
}
impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use RegistryError::*;
        match self {
            IllegalAddress { err, .. } => Some(err),
            ConnectError { err, .. } => Some(err),
            DuplicateAddress { .. }
            | BatchSizeZero { .. }
            | IncompatibleMethods { .. }
            | IncompatibleBatchSize { .. }
            | UnknownWorker { .. }
            | UnknownPid { .. }
            | UnknownServable { .. } => None,
        }
    }
}



/// Defines errors that occur while translating HTTP/JSON payloads from and to the internal request form.
///
/// These are parse-level errors: the REST frontend reports them with a 4xx status code instead of a per-instance error.
#[derive(Debug)]
pub enum RestError {
    /// The URL was not of the form `/model/<servable>[/version/<n>]:<method>`.
    IllegalRoute { raw: String },
    /// The body was not parseable as JSON.
    InvalidJson { err: serde_json::Error },
    /// The top-level object misses the `instances` key.
    MissingInstances,
    /// The `instances` value is neither an object nor an array of objects.
    IllegalInstancesKind,
    /// An input field held a JSON kind we cannot map onto a tensor (e.g., `null`).
    IllegalScalar { input: String },
    /// An input field held an integer that does not fit the inferred dtype.
    IntegerOverflow { input: String },
    /// An array input is not rectangular.
    RaggedArray { input: String },
    /// An array input mixes element types.
    MixedElementTypes { input: String },
    /// An array input is empty, so no element type can be inferred.
    EmptyArray { input: String },
    /// A `{"b64": ...}` object declares a shape that is not an array of non-negative integers.
    IllegalShape { input: String },
    /// A `{"b64": ...}` object misses its `b64` key.
    MissingB64 { input: String },
    /// A `{"b64": ...}` object declares a type we do not know.
    UnknownDataType { input: String, raw: String },
    /// A `{"b64": ...}` object's payload is not valid base64.
    IllegalB64 { input: String, err: base64::DecodeError },
    /// A `{"b64": ...}` object's decoded payload does not match its declared type and shape.
    B64SizeMismatch { input: String, expected: usize, got: usize },
    /// A `{"b64": ...}` object declares a multi-element shape for a string/bytes type.
    B64ObjectShape { input: String },
    /// The parsed pieces did not make for a valid tensor after all.
    IllegalTensor { input: String, err: TensorError },
    /// A reply tensor has a dtype we cannot render as JSON.
    UnsupportedOutput { dtype: DataType },
    /// A reply tensor did not survive the trip from the wire.
    IllegalOutput { output: String },
}
impl Display for RestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use RestError::*;
        match self {
            IllegalRoute { raw } => write!(f, "Illegal predict route '{raw}' (expected '/model/<servable>[/version/<n>]:<method>')"),
            InvalidJson { err } => write!(f, "Failed to parse request body as JSON: {err}"),
            MissingInstances => write!(f, "Request misses top-level 'instances' key"),
            IllegalInstancesKind => write!(f, "The 'instances' value must be an object or an array of objects"),
            IllegalScalar { input } => write!(f, "Input '{input}' holds a JSON kind that does not map onto a tensor"),
            IntegerOverflow { input } => write!(f, "Input '{input}' holds an integer that does not fit its inferred element type"),
            RaggedArray { input } => write!(f, "Input '{input}' is a ragged array"),
            MixedElementTypes { input } => write!(f, "Input '{input}' mixes element types"),
            EmptyArray { input } => write!(f, "Input '{input}' is an empty array, cannot infer its element type"),
            IllegalShape { input } => write!(f, "Input '{input}' declares a shape that is not an array of non-negative integers"),
            MissingB64 { input } => write!(f, "Input '{input}' object misses its 'b64' key"),
            UnknownDataType { input, raw } => write!(f, "Input '{input}' specified type '{raw}' is illegal"),
            IllegalB64 { input, .. } => write!(f, "Input '{input}' does not hold valid base64"),
            B64SizeMismatch { input, expected, got } => {
                write!(f, "Input '{input}' decoded to {got} bytes, expected {expected} for its declared type and shape")
            },
            B64ObjectShape { input } => {
                write!(f, "Input '{input}': only scalar shapes are supported when the data type is string or bytes")
            },
            IllegalTensor { input, .. } => write!(f, "Input '{input}' does not make for a valid tensor"),
            UnsupportedOutput { dtype } => write!(f, "Cannot render {} tensors as JSON", dtype.rest_name()),
            IllegalOutput { output } => write!(f, "Reply tensor '{output}' is malformed"),
        }
    }
}
impl Error for RestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use RestError::*;
        match self {
            InvalidJson { err } => Some(err),
            IllegalB64 { err, .. } => Some(err),
            IllegalTensor { err, .. } => Some(err),
            _ => None,
        }
    }
}
