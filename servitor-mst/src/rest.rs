//  REST.rs
//    by Lut99
//
//  Created:
//    18 Mar 2024, 09:16:40
//  Last edited:
//    31 Jul 2024, 17:23:55
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the HTTP/JSON frontend: warp-paths that accept predict
//!   requests on `/model/<servable>[/version/<n>]:<method>`, translate
//!   the JSON payload to the internal request form and render the reply
//!   back as JSON (with `bytes` payloads travelling base64-encoded
//!   inside `{"b64": ...}` objects).
//

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error, info};
use serde_json::{json, Map, Value};
use specifications::serving::{Instance, PredictReply, PredictRequest, ServableSpec, Tensor as WireTensor};
use specifications::tensor::{DataType, Tensor};
use tokio::sync::oneshot;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::hyper::{Body, Response};
use warp::{Filter, Rejection, Reply};

use crate::dispatcher::Dispatcher;
use crate::errors::RestError;


/***** HELPER MACROS *****/
/// "Casts" the given serde_json value to a JSON response with the given status code.
macro_rules! json_response {
    (StatusCode::$status:ident, $value:expr) => {
        Response::builder()
            .status(StatusCode::$status)
            .header("Content-Type", "application/json")
            .body(Body::from($value.to_string()))
            .unwrap()
    };
}





/***** HELPER FUNCTIONS *****/
/// Parses the route tail of a predict URL into its `(servable, version, method)` parts.
///
/// The tail is everything after `/model/`: either `<servable>:<method>` or `<servable>/version/<n>:<method>`.
///
/// # Errors
/// This function errors if the tail is not of either form.
fn parse_route(raw: &str) -> Result<(String, u64, String), RestError> {
    let (route, method): (&str, &str) = match raw.rfind(':') {
        Some(pos) => (&raw[..pos], &raw[pos + 1..]),
        None => {
            return Err(RestError::IllegalRoute { raw: raw.into() });
        },
    };
    if method.is_empty() {
        return Err(RestError::IllegalRoute { raw: raw.into() });
    }

    let parts: Vec<&str> = route.split('/').collect();
    match parts.as_slice() {
        [servable] if !servable.is_empty() => Ok(((*servable).into(), 0, method.into())),
        [servable, "version", version] if !servable.is_empty() => match version.parse::<u64>() {
            Ok(version) => Ok(((*servable).into(), version, method.into())),
            Err(_) => Err(RestError::IllegalRoute { raw: raw.into() }),
        },
        _ => Err(RestError::IllegalRoute { raw: raw.into() }),
    }
}

/// The kinds of leaf values a JSON array input may hold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LeafKind {
    Int,
    Float,
    Bool,
    Str,
}

/// Reads the shape of a nested JSON array by descending along its first elements.
fn infer_shape(value: &Value) -> Vec<i64> {
    let mut shape: Vec<i64> = vec![];
    let mut current: &Value = value;
    while let Value::Array(arr) = current {
        shape.push(arr.len() as i64);
        match arr.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

/// Collects the leaves of a nested JSON array, verifying it is rectangular along the way.
fn collect_leaves<'v>(input: &str, value: &'v Value, shape: &[i64], out: &mut Vec<&'v Value>) -> Result<(), RestError> {
    match shape.first() {
        None => {
            if value.is_array() {
                return Err(RestError::RaggedArray { input: input.into() });
            }
            out.push(value);
            Ok(())
        },
        Some(dim) => {
            let arr: &Vec<Value> = match value {
                Value::Array(arr) => arr,
                _ => {
                    return Err(RestError::RaggedArray { input: input.into() });
                },
            };
            if arr.len() as i64 != *dim {
                return Err(RestError::RaggedArray { input: input.into() });
            }
            for element in arr {
                collect_leaves(input, element, &shape[1..], out)?;
            }
            Ok(())
        },
    }
}

/// Classifies the given leaves, requiring all of them to share one [`LeafKind`]. Integer and float leaves may mix; the result is then float.
fn classify_leaves(input: &str, leaves: &[&Value]) -> Result<LeafKind, RestError> {
    let mut kind: Option<LeafKind> = None;
    for leaf in leaves {
        let this: LeafKind = match leaf {
            Value::Number(num) => {
                if num.is_i64() || num.is_u64() {
                    LeafKind::Int
                } else {
                    LeafKind::Float
                }
            },
            Value::Bool(_) => LeafKind::Bool,
            Value::String(_) => LeafKind::Str,
            _ => {
                return Err(RestError::IllegalScalar { input: input.into() });
            },
        };
        kind = Some(match (kind, this) {
            (None, this) => this,
            (Some(prev), this) if prev == this => prev,
            // Numbers promote to float as a whole
            (Some(LeafKind::Int), LeafKind::Float) | (Some(LeafKind::Float), LeafKind::Int) => LeafKind::Float,
            (Some(_), _) => {
                return Err(RestError::MixedElementTypes { input: input.into() });
            },
        });
    }
    kind.ok_or_else(|| RestError::EmptyArray { input: input.into() })
}

/// Builds a tensor of the given shape from classified JSON leaves, using the spec's scalar mapping (`i32` for integers, `f32` for floats).
fn leaves_to_tensor(input: &str, shape: Vec<i64>, kind: LeafKind, leaves: &[&Value]) -> Result<Tensor, RestError> {
    let res: Result<Tensor, specifications::tensor::TensorError> = match kind {
        LeafKind::Int => {
            let mut values: Vec<i32> = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                match leaf.as_i64().and_then(|v| i32::try_from(v).ok()) {
                    Some(value) => values.push(value),
                    None => {
                        return Err(RestError::IntegerOverflow { input: input.into() });
                    },
                }
            }
            Tensor::from_i32(shape, &values)
        },
        LeafKind::Float => {
            let mut values: Vec<f32> = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                match leaf.as_f64() {
                    Some(value) => values.push(value as f32),
                    None => {
                        return Err(RestError::IllegalScalar { input: input.into() });
                    },
                }
            }
            Tensor::from_f32(shape, &values)
        },
        LeafKind::Bool => {
            let mut values: Vec<bool> = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                match leaf.as_bool() {
                    Some(value) => values.push(value),
                    None => {
                        return Err(RestError::IllegalScalar { input: input.into() });
                    },
                }
            }
            Tensor::from_bool(shape, &values)
        },
        LeafKind::Str => {
            let mut values: Vec<Vec<u8>> = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                match leaf.as_str() {
                    Some(value) => values.push(value.as_bytes().to_vec()),
                    None => {
                        return Err(RestError::IllegalScalar { input: input.into() });
                    },
                }
            }
            Tensor::new_elements(DataType::String, shape, values)
        },
    };
    res.map_err(|err| RestError::IllegalTensor { input: input.into(), err })
}

/// Parses a `{"b64": base64, "type"?: dtype, "shape"?: [ints]}` object into a tensor.
///
/// Absence of `type` means `bytes`; absence of `shape` means 0-dim. For non-byte dtypes the decoded length must equal
/// `element_count * itemsize`; for byte/string dtypes the element count must be 1.
fn b64_to_tensor(input: &str, obj: &Map<String, Value>) -> Result<Tensor, RestError> {
    let encoded: &str = match obj.get("b64") {
        Some(Value::String(encoded)) => encoded,
        _ => {
            return Err(RestError::MissingB64 { input: input.into() });
        },
    };
    let dtype: DataType = match obj.get("type") {
        Some(Value::String(name)) => match DataType::from_rest_name(name) {
            Some(dtype) => dtype,
            None => {
                return Err(RestError::UnknownDataType { input: input.into(), raw: name.clone() });
            },
        },
        Some(_) => {
            return Err(RestError::UnknownDataType { input: input.into(), raw: String::new() });
        },
        None => DataType::Bytes,
    };
    let shape: Vec<i64> = match obj.get("shape") {
        Some(Value::Array(dims)) => {
            let mut shape: Vec<i64> = Vec::with_capacity(dims.len());
            for dim in dims {
                match dim.as_i64() {
                    Some(dim) if dim >= 0 => shape.push(dim),
                    _ => {
                        return Err(RestError::IllegalShape { input: input.into() });
                    },
                }
            }
            shape
        },
        Some(_) => {
            return Err(RestError::IllegalShape { input: input.into() });
        },
        None => vec![],
    };

    let decoded: Vec<u8> = match STANDARD.decode(encoded) {
        Ok(decoded) => decoded,
        Err(err) => {
            return Err(RestError::IllegalB64 { input: input.into(), err });
        },
    };
    let element_count: usize = shape.iter().product::<i64>() as usize;
    if dtype.is_packed() {
        let expected: usize = element_count * dtype.itemsize();
        if decoded.len() != expected {
            return Err(RestError::B64SizeMismatch { input: input.into(), expected, got: decoded.len() });
        }
        Tensor::new_packed(dtype, shape, decoded).map_err(|err| RestError::IllegalTensor { input: input.into(), err })
    } else {
        if element_count != 1 {
            return Err(RestError::B64ObjectShape { input: input.into() });
        }
        Tensor::new_elements(dtype, shape, vec![decoded]).map_err(|err| RestError::IllegalTensor { input: input.into(), err })
    }
}

/// Translates one JSON input field into a tensor, following the frontend's mapping rules.
fn json_to_tensor(input: &str, value: &Value) -> Result<Tensor, RestError> {
    match value {
        // A scalar becomes a 0-dim tensor of the matching dtype
        Value::Number(_) | Value::Bool(_) | Value::String(_) => {
            let leaves: Vec<&Value> = vec![value];
            let kind: LeafKind = classify_leaves(input, &leaves)?;
            leaves_to_tensor(input, vec![], kind, &leaves)
        },
        // An array becomes a tensor whose shape follows the nesting
        Value::Array(_) => {
            let shape: Vec<i64> = infer_shape(value);
            let mut leaves: Vec<&Value> = vec![];
            collect_leaves(input, value, &shape, &mut leaves)?;
            let kind: LeafKind = classify_leaves(input, &leaves)?;
            leaves_to_tensor(input, shape, kind, &leaves)
        },
        // An object is the base64 form
        Value::Object(obj) => b64_to_tensor(input, obj),
        _ => Err(RestError::IllegalScalar { input: input.into() }),
    }
}

/// Parses the body of a predict request into the internal instance list.
///
/// # Errors
/// This function errors if the body is not JSON, misses the `instances` key or any input field does not follow the mapping rules.
fn parse_instances(body: &[u8]) -> Result<Vec<Instance>, RestError> {
    let body: Value = match serde_json::from_slice(body) {
        Ok(body) => body,
        Err(err) => {
            return Err(RestError::InvalidJson { err });
        },
    };
    let instances: &Value = match body.as_object().and_then(|obj| obj.get("instances")) {
        Some(instances) => instances,
        None => {
            return Err(RestError::MissingInstances);
        },
    };

    // A single object is one instance; an array of objects is several
    let objects: Vec<&Map<String, Value>> = match instances {
        Value::Object(obj) => vec![obj],
        Value::Array(arr) => {
            let mut objects: Vec<&Map<String, Value>> = Vec::with_capacity(arr.len());
            for element in arr {
                match element.as_object() {
                    Some(obj) => objects.push(obj),
                    None => {
                        return Err(RestError::IllegalInstancesKind);
                    },
                }
            }
            objects
        },
        _ => {
            return Err(RestError::IllegalInstancesKind);
        },
    };

    let mut result: Vec<Instance> = Vec::with_capacity(objects.len());
    for obj in objects {
        let mut items: HashMap<String, WireTensor> = HashMap::with_capacity(obj.len());
        for (name, value) in obj {
            let tensor: Tensor = json_to_tensor(name, value)?;
            items.insert(name.clone(), WireTensor::from(tensor));
        }
        result.push(Instance { items });
    }
    Ok(result)
}

/// Folds a flat list of JSON values into nested arrays following the given shape (0-dim collapses to the bare value).
fn nest_values(mut values: Vec<Value>, shape: &[i64]) -> Value {
    if shape.is_empty() {
        return values.pop().unwrap_or(Value::Null);
    }
    for dim in shape.iter().skip(1).rev() {
        // A 0-sized dimension has no values to chunk (and `chunks()` refuses a 0 size)
        let dim: usize = (*dim).max(1) as usize;
        values = values.chunks(dim).map(|chunk| Value::Array(chunk.to_vec())).collect();
    }
    Value::Array(values)
}

/// Renders one reply tensor as JSON, using the inverse of the request mapping.
fn tensor_to_json(output: &str, tensor: &WireTensor) -> Result<Value, RestError> {
    let tensor: Tensor = match Tensor::try_from(tensor.clone()) {
        Ok(tensor) => tensor,
        Err(_) => {
            return Err(RestError::IllegalOutput { output: output.into() });
        },
    };
    let shape: Vec<i64> = tensor.shape().to_vec();

    use DataType::*;
    let values: Vec<Value> = match tensor.dtype() {
        Bool => tensor.to_bool_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Int8 => tensor.to_i8_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Int16 => tensor.to_i16_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Int32 => tensor.to_i32_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Int64 => tensor.to_i64_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Uint8 => tensor.to_u8_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Uint16 => tensor.to_u16_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Uint32 => tensor.to_u32_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Uint64 => tensor.to_u64_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Float32 => tensor.to_f32_vec().unwrap_or_default().into_iter().map(|v| Value::from(v as f64)).collect(),
        Float64 => tensor.to_f64_vec().unwrap_or_default().into_iter().map(Value::from).collect(),
        Float16 => {
            return Err(RestError::UnsupportedOutput { dtype: Float16 });
        },
        String => tensor
            .elements()
            .unwrap_or_default()
            .iter()
            .map(|e| Value::from(std::string::String::from_utf8_lossy(e).into_owned()))
            .collect(),
        Bytes => tensor.elements().unwrap_or_default().iter().map(|e| json!({ "b64": STANDARD.encode(e) })).collect(),
    };
    Ok(nest_values(values, &shape))
}

/// Renders a full reply as the response JSON.
///
/// Per-instance failures keep HTTP status 200: failed instances are rendered as `{"error_msg": ...}` entries. A request-wide failure becomes a
/// single top-level `error_msg`.
fn encode_reply(reply: &PredictReply) -> Result<Value, RestError> {
    if reply.instances.is_empty() && !reply.error_msg.is_empty() {
        return Ok(json!({ "error_msg": reply.error_msg[0].error_msg }));
    }

    let mut instances: Vec<Value> = Vec::with_capacity(reply.instances.len());
    for (i, instance) in reply.instances.iter().enumerate() {
        if let Some(error) = reply.error_msg.get(i) {
            if !error.is_ok() {
                instances.push(json!({ "error_msg": error.error_msg }));
                continue;
            }
        }
        let mut map: Map<String, Value> = Map::new();
        for (name, tensor) in &instance.items {
            map.insert(name.clone(), tensor_to_json(name, tensor)?);
        }
        instances.push(Value::Object(map));
    }
    Ok(json!({ "instances": instances }))
}





/***** LIBRARY *****/
/// Handles an incoming predict POST.
///
/// # Arguments
/// - `tail`: The URL path after `/model/`, i.e., `<servable>[/version/<n>]:<method>`.
/// - `body`: The raw request body, parsed as JSON here.
/// - `dispatcher`: The dispatcher shared by all frontends.
///
/// # Returns
/// A response with the following codes:
/// - `200 OK` with the reply JSON, also when individual instances (or the request as a whole) failed inside the dispatcher.
/// - `400 BAD REQUEST` if the route or the body did not parse.
/// - `500 INTERNAL SERVER ERROR` if the completion callback never fired.
pub async fn handle_predict(tail: warp::path::Tail, body: Bytes, dispatcher: Dispatcher) -> Result<impl Reply, Rejection> {
    info!("Handling POST on '/model/{}' (i.e., REST predict)...", tail.as_str());

    // Resolve what is being called
    let (servable_name, version_number, method_name): (String, u64, String) = match parse_route(tail.as_str()) {
        Ok(route) => route,
        Err(err) => {
            error!("{err}");
            return Ok(json_response!(StatusCode::BAD_REQUEST, json!({ "error_msg": err.to_string() })));
        },
    };

    // Translate the payload
    debug!("Parsing incoming body...");
    let instances: Vec<Instance> = match parse_instances(&body) {
        Ok(instances) => instances,
        Err(err) => {
            error!("{err}");
            return Ok(json_response!(StatusCode::BAD_REQUEST, json!({ "error_msg": err.to_string() })));
        },
    };

    // Hand the request to the dispatcher and park until the completion callback fires
    let request: PredictRequest =
        PredictRequest { spec: ServableSpec { name: servable_name, version_number, method_name }, instances };
    let (tx, rx): (oneshot::Sender<PredictReply>, oneshot::Receiver<PredictReply>) = oneshot::channel();
    dispatcher.dispatch(
        request,
        Box::new(move |reply| {
            let _ = tx.send(reply);
        }),
    );
    let reply: PredictReply = match rx.await {
        Ok(reply) => reply,
        Err(_) => {
            error!("Reply channel closed before the request completed");
            return Ok(json_response!(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error_msg": "Internal server error" })));
        },
    };

    // Render it back as JSON
    match encode_reply(&reply) {
        Ok(value) => Ok(json_response!(StatusCode::OK, value)),
        Err(err) => {
            error!("{err}");
            Ok(json_response!(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error_msg": err.to_string() })))
        },
    }
}

/// Builds the warp filter for the REST frontend.
///
/// # Arguments
/// - `dispatcher`: The dispatcher shared by all frontends.
///
/// # Returns
/// The filter serving `POST /model/<servable>[/version/<n>]:<method>`.
pub fn routes(dispatcher: Dispatcher) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::post()
        .and(warp::path("model"))
        .and(warp::path::tail())
        .and(warp::body::bytes())
        .and(warp::any().map(move || dispatcher.clone()))
        .and_then(handle_predict)
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_parsing() {
        assert_eq!(parse_route("test_servable:add_common").unwrap(), ("test_servable".into(), 0, "add_common".into()));
        assert_eq!(parse_route("test_servable/version/2:add_common").unwrap(), ("test_servable".into(), 2, "add_common".into()));
        assert!(matches!(parse_route("test_servable"), Err(RestError::IllegalRoute { .. })));
        assert!(matches!(parse_route("test_servable:"), Err(RestError::IllegalRoute { .. })));
        assert!(matches!(parse_route(":add_common"), Err(RestError::IllegalRoute { .. })));
        assert!(matches!(parse_route("test_servable/version/latest:add_common"), Err(RestError::IllegalRoute { .. })));
        assert!(matches!(parse_route("a/b/c/d:add_common"), Err(RestError::IllegalRoute { .. })));
    }

    #[test]
    fn scalars_become_zero_dim_tensors() {
        let tensor: Tensor = json_to_tensor("x", &json!(42)).unwrap();
        assert_eq!(tensor.dtype(), DataType::Int32);
        assert!(tensor.shape().is_empty());
        assert_eq!(tensor.to_i32_vec().unwrap(), vec![42]);

        let tensor: Tensor = json_to_tensor("x", &json!(1.5)).unwrap();
        assert_eq!(tensor.dtype(), DataType::Float32);
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.5]);

        let tensor: Tensor = json_to_tensor("x", &json!(true)).unwrap();
        assert_eq!(tensor.dtype(), DataType::Bool);

        let tensor: Tensor = json_to_tensor("x", &json!("hello")).unwrap();
        assert_eq!(tensor.dtype(), DataType::String);
        assert_eq!(tensor.elements().unwrap()[0], b"hello");

        assert!(matches!(json_to_tensor("x", &Value::Null), Err(RestError::IllegalScalar { .. })));
    }

    #[test]
    fn arrays_infer_shape_and_dtype() {
        let tensor: Tensor = json_to_tensor("x", &json!([[1.1, 2.2], [3.3, 4.4]])).unwrap();
        assert_eq!(tensor.dtype(), DataType::Float32);
        assert_eq!(tensor.shape(), &[2, 2]);

        // Integers stay integers; a single float promotes the lot
        let tensor: Tensor = json_to_tensor("x", &json!([1, 2, 3])).unwrap();
        assert_eq!(tensor.dtype(), DataType::Int32);
        let tensor: Tensor = json_to_tensor("x", &json!([1, 2.5, 3])).unwrap();
        assert_eq!(tensor.dtype(), DataType::Float32);

        assert!(matches!(json_to_tensor("x", &json!([[1, 2], [3]])), Err(RestError::RaggedArray { .. })));
        assert!(matches!(json_to_tensor("x", &json!([1, [2]])), Err(RestError::RaggedArray { .. })));
        assert!(matches!(json_to_tensor("x", &json!([1, "two"])), Err(RestError::MixedElementTypes { .. })));
        assert!(matches!(json_to_tensor("x", &json!([])), Err(RestError::EmptyArray { .. })));
        assert!(matches!(json_to_tensor("x", &json!([4294967296i64])), Err(RestError::IntegerOverflow { .. })));
    }

    #[test]
    fn b64_int16_object() {
        // 12 bytes of little-endian int16: [[1, 2], [2, 3], [3, 4]]
        let value: Value = json!({ "b64": "AQACAAIAAwADAAQA", "type": "int16", "shape": [3, 2] });
        let tensor: Tensor = json_to_tensor("key_bytes_int16", &value).unwrap();
        assert_eq!(tensor.dtype(), DataType::Int16);
        assert_eq!(tensor.shape(), &[3, 2]);
        assert_eq!(tensor.to_i16_vec().unwrap(), vec![1, 2, 2, 3, 3, 4]);
    }

    #[test]
    fn b64_defaults_and_checks() {
        // No type, no shape: a 0-dim bytes tensor
        let encoded: String = STANDARD.encode(b"raw payload");
        let tensor: Tensor = json_to_tensor("x", &json!({ "b64": encoded })).unwrap();
        assert_eq!(tensor.dtype(), DataType::Bytes);
        assert!(tensor.shape().is_empty());
        assert_eq!(tensor.elements().unwrap()[0], b"raw payload");

        assert!(matches!(json_to_tensor("x", &json!({ "type": "int16" })), Err(RestError::MissingB64 { .. })));
        assert!(matches!(json_to_tensor("x", &json!({ "b64": "AQA=", "type": "complex64" })), Err(RestError::UnknownDataType { .. })));
        assert!(matches!(json_to_tensor("x", &json!({ "b64": "not base64!!" })), Err(RestError::IllegalB64 { .. })));
        assert!(matches!(
            json_to_tensor("x", &json!({ "b64": "AQA=", "type": "int16", "shape": [3] })),
            Err(RestError::B64SizeMismatch { expected: 6, got: 2, .. })
        ));
        assert!(matches!(
            json_to_tensor("x", &json!({ "b64": "AQA=", "type": "str", "shape": [2] })),
            Err(RestError::B64ObjectShape { .. })
        ));
        assert!(matches!(
            json_to_tensor("x", &json!({ "b64": "AQA=", "type": "int16", "shape": [-1] })),
            Err(RestError::IllegalShape { .. })
        ));
    }

    #[test]
    fn base64_roundtrip() {
        for payload in [&b""[..], &b"a"[..], &b"ab"[..], &b"abc"[..], &b"\x00\xff\x10"[..]] {
            let encoded: String = STANDARD.encode(payload);
            // Standard padding: 4 output characters for every started group of 3 input bytes
            assert_eq!(encoded.len(), payload.len().div_ceil(3) * 4);
            assert_eq!(STANDARD.decode(&encoded).unwrap(), payload);
        }
    }

    #[test]
    fn instances_accept_object_and_array() {
        let single: Vec<Instance> = parse_instances(br#"{"instances": {"x": 1}}"#).unwrap();
        assert_eq!(single.len(), 1);
        let multiple: Vec<Instance> = parse_instances(br#"{"instances": [{"x": 1}, {"x": 2}]}"#).unwrap();
        assert_eq!(multiple.len(), 2);

        assert!(matches!(parse_instances(b"not json"), Err(RestError::InvalidJson { .. })));
        assert!(matches!(parse_instances(br#"{"inputs": {}}"#), Err(RestError::MissingInstances)));
        assert!(matches!(parse_instances(br#"{"instances": 5}"#), Err(RestError::IllegalInstancesKind)));
        assert!(matches!(parse_instances(br#"{"instances": [5]}"#), Err(RestError::IllegalInstancesKind)));
    }

    #[test]
    fn json_path_roundtrip() {
        // Encoding the parsed tensor yields the original JSON value back
        for value in [json!([[1.1, 2.2], [3.3, 4.4]]), json!([1, 2, 3]), json!([[true], [false]]), json!(7)] {
            let tensor: Tensor = json_to_tensor("x", &value).unwrap();
            let rendered: Value = tensor_to_json("x", &WireTensor::from(tensor)).unwrap();
            match &value {
                // Floats survive as f32, so compare leaf-wise with a tolerance
                Value::Array(_) if value[0][0].is_f64() => {
                    let shape: Vec<i64> = infer_shape(&value);
                    let mut want: Vec<&Value> = vec![];
                    collect_leaves("x", &value, &shape, &mut want).unwrap();
                    let mut got: Vec<&Value> = vec![];
                    collect_leaves("x", &rendered, &shape, &mut got).unwrap();
                    for (w, g) in want.iter().zip(got.iter()) {
                        assert!((w.as_f64().unwrap() - g.as_f64().unwrap()).abs() < 1e-6);
                    }
                },
                _ => assert_eq!(rendered, value),
            }
        }
    }

    #[test]
    fn reply_encoding() {
        use specifications::serving::{ErrorMsg, StatusCode as WireStatus};

        // A request-wide failure collapses to one top-level error_msg
        let reply: PredictReply = PredictReply {
            spec: ServableSpec { name: "s".into(), version_number: 1, method_name: "m".into() },
            instances: vec![],
            error_msg: vec![ErrorMsg::new(WireStatus::InvalidInputs, "servable is not available")],
        };
        assert_eq!(encode_reply(&reply).unwrap(), json!({ "error_msg": "servable is not available" }));

        // Mixed results render per instance
        let ok_instance: Instance = Instance {
            items: HashMap::from([("y".to_string(), WireTensor::from(Tensor::from_i32([2], &[1, 2]).unwrap()))]),
        };
        let reply: PredictReply = PredictReply {
            spec: ServableSpec { name: "s".into(), version_number: 1, method_name: "m".into() },
            instances: vec![ok_instance, Instance { items: HashMap::new() }],
            error_msg: vec![ErrorMsg::ok(), ErrorMsg::new(WireStatus::Failed, "model exploded")],
        };
        assert_eq!(
            encode_reply(&reply).unwrap(),
            json!({ "instances": [{ "y": [1, 2] }, { "error_msg": "model exploded" }] })
        );

        // Bytes outputs are base64-wrapped again
        let bytes_instance: Instance = Instance {
            items: HashMap::from([(
                "blob".to_string(),
                WireTensor::from(Tensor::new_elements(DataType::Bytes, vec![], vec![b"abc".to_vec()]).unwrap()),
            )]),
        };
        let reply: PredictReply = PredictReply {
            spec: ServableSpec { name: "s".into(), version_number: 1, method_name: "m".into() },
            instances: vec![bytes_instance],
            error_msg: vec![],
        };
        assert_eq!(encode_reply(&reply).unwrap(), json!({ "instances": [{ "blob": { "b64": "YWJj" } }] }));
    }
}
