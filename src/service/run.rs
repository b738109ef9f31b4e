//! The `POST /run` pipeline: approval, validation, dispatch.
//!
//! Every outcome is an HTTP 200 with a structured body; the generated
//! kernel-side preamble turns error bodies into a `ToolCallError`.

use axum::{extract::State, Json};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::ServiceState;
use crate::approval::ApprovalError;
use sandcell_protocol::{ErrorKind, RunRequest, RunResponse};
use sandcell_providers::{validate_args, ProviderError};

pub(crate) async fn handle_run(
    State(state): State<ServiceState>,
    Json(request): Json<RunRequest>,
) -> Json<RunResponse> {
    Json(run_pipeline(&state, request).await)
}

async fn run_pipeline(state: &ServiceState, request: RunRequest) -> RunResponse {
    let RunRequest {
        provider,
        tool,
        mut args,
    } = request;

    // 1. Approval. Mandatory for every call; there is no bypass.
    match state.approvals.request(&provider, &tool, args.clone()).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(provider, tool, "Tool call rejected by host");
            return RunResponse::failure(
                ErrorKind::ApprovalRejected,
                format!("host rejected the call to '{provider}:{tool}'"),
            );
        }
        Err(ApprovalError::Timeout) => {
            return RunResponse::failure(
                ErrorKind::ApprovalTimeout,
                format!("no approval decision for '{provider}:{tool}' within the timeout"),
            );
        }
        Err(ApprovalError::Cancelled) => {
            return RunResponse::failure(
                ErrorKind::ApprovalCancelled,
                "the surrounding execution was cancelled",
            );
        }
        Err(e) => {
            warn!(provider, tool, "Approval channel unavailable: {}", e);
            return RunResponse::failure(ErrorKind::Internal, e.to_string());
        }
    }

    // 2. Validate against the tool's input schema.
    let descriptor = match state.backend.describe(&provider, &tool).await {
        Ok(descriptor) => descriptor,
        Err(e) => return RunResponse::failure(provider_error_kind(&e), e.to_string()),
    };
    if let Err(message) = validate_args(&descriptor.input_schema, &mut args) {
        return RunResponse::failure(ErrorKind::Validation, message);
    }
    let args_map = match into_args_map(args) {
        Ok(map) => map,
        Err(message) => return RunResponse::failure(ErrorKind::Validation, message),
    };

    // 3. Dispatch, with one retry against a fresh session on transport
    //    errors. Approval is not repeated.
    let text = match state
        .backend
        .invoke(&provider, &tool, args_map.clone())
        .await
    {
        Ok(text) => text,
        Err(first) if first.is_transport() => {
            warn!(provider, tool, "Transport error, retrying once: {}", first);
            match state.backend.invoke(&provider, &tool, args_map).await {
                Ok(text) => text,
                Err(second) => {
                    return RunResponse::failure(
                        provider_error_kind(&second),
                        second.to_string(),
                    )
                }
            }
        }
        Err(e) => return RunResponse::failure(provider_error_kind(&e), e.to_string()),
    };

    // 4. Shape the result: a structured tree when the tool declares an
    //    output schema and the text parses, otherwise the raw text.
    let result = if descriptor.has_output_schema {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    } else {
        Value::String(text)
    };
    RunResponse::success(result)
}

fn into_args_map(args: Value) -> Result<Option<Map<String, Value>>, String> {
    match args {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(format!(
            "arguments must be an object, got {}",
            type_name(&other)
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn provider_error_kind(error: &ProviderError) -> ErrorKind {
    match error {
        ProviderError::NotRegistered(_)
        | ProviderError::ToolNotFound(_)
        | ProviderError::InvalidArguments(_)
        | ProviderError::Spec(_)
        | ProviderError::UnresolvedEnv { .. } => ErrorKind::Validation,
        ProviderError::Tool(_) => ErrorKind::Tool,
        ProviderError::Transport(_)
        | ProviderError::ConnectionFailed(_)
        | ProviderError::Protocol(_) => ErrorKind::Transport,
    }
}
