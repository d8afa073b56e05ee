//! JSON-over-HTTP plumbing shared by the model backends.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use qr_core::{Error, Message, ToolCall, ToolDefinition};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client with a bounded connect phase. The overall call deadline is owned
/// by the agent, not the backend.
pub(crate) fn client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Send `body` as JSON and decode a successful reply as `T`.
///
/// Non-2xx replies are mapped onto [`Error`] using the `{"error": {"message"}}`
/// envelope all three vendors share.
pub(crate) async fn post_json<B, T>(
    backend: &str,
    request: RequestBuilder,
    body: &B,
) -> Result<T, Error>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    trace!(
        backend,
        payload = %serde_json::to_string(body).unwrap_or_default(),
        "Sending model request"
    );

    let response = request.json(body).send().await.map_err(|e| {
        if e.is_timeout() {
            Error::timeout(e.to_string())
        } else {
            Error::network(e.to_string())
        }
    })?;

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| Error::network(e.to_string()))?;

    if !(200..300).contains(&status) {
        error!(backend, status, body = %text, "Model request failed");
        return Err(status_error(status, &text));
    }

    trace!(backend, payload = %text, "Model response");
    serde_json::from_str(&text).map_err(|e| Error::serialization(format!("{} response: {}", backend, e)))
}

pub(crate) fn status_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct Envelope {
        error: Detail,
    }

    #[derive(Deserialize)]
    struct Detail {
        message: String,
    }

    match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) => Error::from_status(status, envelope.error.message),
        Err(_) => Error::api(status, body.to_string()),
    }
}

/// JSON schema of a tool's parameters.
pub(crate) fn schema_of(tool: &ToolDefinition) -> serde_json::Value {
    serde_json::to_value(&tool.parameters).unwrap_or_default()
}

/// Assemble the assistant reply from decoded text fragments and calls.
pub(crate) fn assistant_reply(texts: Vec<String>, tool_calls: Vec<ToolCall>) -> Message {
    let text = texts.join("\n");
    if tool_calls.is_empty() {
        Message::assistant(text)
    } else {
        Message::assistant_with_tool_calls(text, tool_calls)
    }
}

/// Fold runs of entries that share a role into one, since both Anthropic
/// and Gemini reject consecutive turns from the same side.
pub(crate) fn coalesce<T, P>(
    entries: Vec<T>,
    same_role: impl Fn(&T, &T) -> bool,
    parts: impl Fn(&mut T) -> &mut Vec<P>,
) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(entries.len());
    for mut entry in entries {
        match out.last_mut() {
            Some(last) if same_role(&*last, &entry) => {
                let moved = std::mem::take(parts(&mut entry));
                parts(last).extend(moved);
            }
            _ => out.push(entry),
        }
    }
    out
}
