//! The extension pipeline (§4.5): pure outbound/inbound message transforms.

use serde_json::{json, Value};

/// A pair of pure transforms applied to outbound and inbound envelopes at
/// the dispatcher boundary.
///
/// Implementations must tolerate being called on any meta or user channel.
/// Errors raised from either method are caught at the call site and treated
/// as identity (§4.5) — a panicking or erroring extension never blocks the
/// pipeline, it just contributes nothing for that message.
pub trait FayeExtension: Send + Sync {
    /// Transforms an outbound envelope before it is handed to the transport.
    fn outgoing(&self, message: Value) -> Value;

    /// Transforms an inbound envelope before the dispatcher/client routes it.
    fn incoming(&self, message: Value) -> Value;
}

/// Applies `extension.outgoing`, falling back to the original message and
/// logging a warning if the extension panics.
pub(crate) fn apply_outgoing(extension: Option<&dyn FayeExtension>, message: Value) -> Value {
    let Some(extension) = extension else { return message };
    let original = message.clone();
    let guarded = std::panic::AssertUnwindSafe(|| extension.outgoing(message));
    match std::panic::catch_unwind(guarded) {
        Ok(transformed) => transformed,
        Err(_) => {
            tracing::warn!("outgoing extension panicked; using original message");
            original
        }
    }
}

/// Applies `extension.incoming`, falling back to the original message and
/// logging a warning if the extension panics.
pub(crate) fn apply_incoming(extension: Option<&dyn FayeExtension>, message: Value) -> Value {
    let Some(extension) = extension else { return message };
    let original = message.clone();
    let guarded = std::panic::AssertUnwindSafe(|| extension.incoming(message));
    match std::panic::catch_unwind(guarded) {
        Ok(transformed) => transformed,
        Err(_) => {
            tracing::warn!("incoming extension panicked; using original message");
            original
        }
    }
}

/// Inserts `ext.api` / `ext.token` authentication fields into outbound
/// messages. Inbound messages pass through unchanged.
pub struct DefaultExtension {
    api_key: String,
    token: String,
}

impl DefaultExtension {
    pub fn new(api_key: impl Into<String>, token: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), token: token.into() }
    }
}

impl FayeExtension for DefaultExtension {
    fn outgoing(&self, mut message: Value) -> Value {
        if let Value::Object(map) = &mut message {
            let ext = map.entry("ext").or_insert_with(|| json!({}));
            if let Value::Object(ext_map) = ext {
                ext_map.insert("api".into(), json!(self.api_key));
                ext_map.insert("token".into(), json!(self.token));
            }
        }
        message
    }

    fn incoming(&self, message: Value) -> Value {
        message
    }
}

/// Wraps caller-supplied transform closures, for callers that would rather
/// hand over two `Fn(Value) -> Value` values than implement
/// [`FayeExtension`].
pub struct CustomExtension<O, I>
where
    O: Fn(Value) -> Value + Send + Sync,
    I: Fn(Value) -> Value + Send + Sync,
{
    outgoing: O,
    incoming: I,
}

impl<O, I> CustomExtension<O, I>
where
    O: Fn(Value) -> Value + Send + Sync,
    I: Fn(Value) -> Value + Send + Sync,
{
    pub fn new(outgoing: O, incoming: I) -> Self {
        Self { outgoing, incoming }
    }
}

impl<O, I> FayeExtension for CustomExtension<O, I>
where
    O: Fn(Value) -> Value + Send + Sync,
    I: Fn(Value) -> Value + Send + Sync,
{
    fn outgoing(&self, message: Value) -> Value {
        (self.outgoing)(message)
    }

    fn incoming(&self, message: Value) -> Value {
        (self.incoming)(message)
    }
}
