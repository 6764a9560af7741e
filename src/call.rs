//! Call value objects
//!
//! A [`Call`] binds one [`Request`] to its [`Response`] for the duration of
//! a before → execute → after cycle. Calls form a tree: a call started from
//! inside an observer while another call is in flight is a *child* and
//! carries its parent's id (a non-owning back reference) and the id of the
//! root call of the tree.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CallError;
use crate::path::{self, ValuePath};

/// Identity of a call inside the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(Uuid);

impl CallId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Outgoing remote call: method, positional parameters, side-channel attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: String,
    params: Vec<Value>,
    attributes: BTreeMap<String, Value>,
    frozen: bool,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            attributes: BTreeMap::new(),
            frozen: false,
        }
    }

    /// Builder-style attribute setter for requests that are not frozen yet
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Parameters viewed as one sequence, so `"0.user.id"` style paths apply
    pub fn params_value(&self) -> Value {
        Value::Array(self.params.clone())
    }

    /// Attributes viewed as one mapping, so `"user.id"` style paths apply
    pub fn attributes_value(&self) -> Value {
        Value::Object(self.attributes.clone().into_iter().collect())
    }

    /// Resolve a dotted path against the attributes; `null` counts as absent
    pub fn attribute_at(&self, path: &ValuePath) -> Option<Value> {
        let (head, rest) = path.as_str().split_once('.').unwrap_or((path.as_str(), ""));
        let root = self.attributes.get(head)?;
        if rest.is_empty() {
            return (!root.is_null()).then(|| root.clone());
        }
        let rest = ValuePath::parse(rest).ok()?;
        path::get_present(root, &rest).cloned()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn set_method(&mut self, method: impl Into<String>) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.method = method.into();
        Ok(())
    }

    pub fn set_params(&mut self, params: Vec<Value>) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.params = params;
        Ok(())
    }

    /// Write inside the parameter list, e.g. `"1.filter.limit"`
    pub fn set_param_at(&mut self, path: &ValuePath, value: Value) -> Result<(), CallError> {
        self.ensure_mutable()?;
        let mut params = Value::Array(std::mem::take(&mut self.params));
        path::set_path(&mut params, path, value);
        self.params = match params {
            Value::Array(items) => items,
            other => vec![other],
        };
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.attributes.insert(name.into(), value);
        Ok(())
    }

    pub fn remove_attribute(&mut self, name: &str) -> Result<Option<Value>, CallError> {
        self.ensure_mutable()?;
        Ok(self.attributes.remove(name))
    }

    fn ensure_mutable(&self) -> Result<(), CallError> {
        if self.frozen {
            return Err(CallError::RequestFrozen {
                method: self.method.clone(),
            });
        }
        Ok(())
    }
}

/// Error returned by the wrapped service
///
/// `trace` is diagnostic only and never serialized, so whatever is written
/// to the cache is already the stripped form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(skip)]
    pub trace: Option<String>,
}

impl ServiceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            trace: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Copy without the trace
    pub fn stripped(&self) -> Self {
        Self {
            trace: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ServiceError {}

/// Result container of a call
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    result: Option<Value>,
    error: Option<ServiceError>,
    cacheable: bool,
    frozen: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            result: None,
            error: None,
            cacheable: true,
            frozen: false,
        }
    }
}

impl Response {
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ServiceError> {
        self.error.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Set the result; an existing error is left in place
    pub fn set_result(&mut self, value: Value) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.result = Some(value);
        Ok(())
    }

    /// Set the error; an existing result is left in place
    pub fn set_error(&mut self, error: ServiceError) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.error = Some(error);
        Ok(())
    }

    pub fn clear_error(&mut self) -> Result<Option<ServiceError>, CallError> {
        self.ensure_mutable()?;
        Ok(self.error.take())
    }

    pub fn set_cacheable(&mut self, cacheable: bool) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.cacheable = cacheable;
        Ok(())
    }

    /// Write inside the result, e.g. `"items.0.price"`
    pub fn set_result_at(&mut self, path: &ValuePath, value: Value) -> Result<(), CallError> {
        self.ensure_mutable()?;
        let root = self.result.get_or_insert(Value::Null);
        path::set_path(root, path, value);
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), CallError> {
        if self.frozen {
            return Err(CallError::ResponseFrozen);
        }
        Ok(())
    }
}

/// One invocation of a remote method
#[derive(Debug)]
pub struct Call {
    id: CallId,
    root: CallId,
    parent: Option<CallId>,
    service: String,
    request: Request,
    response: Response,
    terminating: bool,
    cancellers: BTreeSet<String>,
    info: HashMap<String, Value>,
}

impl Call {
    /// New root call
    pub fn new(request: Request) -> Self {
        let id = CallId::generate();
        Self {
            id,
            root: id,
            parent: None,
            service: String::new(),
            request,
            response: Response::default(),
            terminating: false,
            cancellers: BTreeSet::new(),
            info: HashMap::new(),
        }
    }

    /// Call started while `parent` is in flight
    pub fn child_of(parent: &Call, request: Request) -> Self {
        Self {
            root: parent.root,
            parent: Some(parent.id),
            service: parent.service.clone(),
            terminating: parent.terminating,
            ..Self::new(request)
        }
    }

    /// Name of the remote service, kept for grace refreshes and logs
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Record the service executing this call unless one is already named
    pub(crate) fn default_service(&mut self, service: &str) {
        if self.service.is_empty() {
            self.service = service.to_string();
        }
    }

    /// Mark as issued during shutdown/drain
    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn root(&self) -> CallId {
        self.root
    }

    pub fn parent(&self) -> Option<CallId> {
        self.parent
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Suppress execution of the wrapped service; `by` is kept for diagnostics
    pub fn cancel(&mut self, by: impl Into<String>) {
        self.cancellers.insert(by.into());
    }

    pub fn is_cancelled(&self) -> bool {
        !self.cancellers.is_empty()
    }

    pub fn cancellers(&self) -> &BTreeSet<String> {
        &self.cancellers
    }

    pub fn info(&self, key: &str) -> Option<&Value> {
        self.info.get(key)
    }

    pub fn set_info(&mut self, key: impl Into<String>, value: Value) {
        self.info.insert(key.into(), value);
    }
}
