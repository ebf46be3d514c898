use crate::router::arguments::Arguments;
use crate::router::error::InvokeError;
use crate::router::method_fn::Invoke;
use http::Method;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// What a caller asks for: a verb qualified method path and an optional version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub method: Method,
    pub path: String,
    pub version: Option<String>,
}

impl RouteKey {
    pub fn new<S: Into<String>>(method: Method, path: S) -> Self {
        Self { method, path: path.into(), version: None }
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Parameter and return shapes of a bound method, by type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    pub params: &'static str,
    pub returns: &'static str,
}

/// One method of one registered handler.
pub struct RouteEntry {
    method: Method,
    path: String,
    versions: BTreeSet<String>,
    handler_type: &'static str,
    invoker: Option<Arc<dyn Invoke>>,
}

impl RouteEntry {
    pub fn new<S: Into<String>>(
        method: Method,
        path: S,
        versions: BTreeSet<String>,
        handler_type: &'static str,
        invoker: Arc<dyn Invoke>,
    ) -> Self {
        Self { method, path: path.into(), versions, handler_type, invoker: Some(invoker) }
    }

    /// An entry that is known to the router but never dispatched to.
    pub fn ignored<S: Into<String>>(method: Method, path: S, versions: BTreeSet<String>, handler_type: &'static str) -> Self {
        Self { method, path: path.into(), versions, handler_type, invoker: None }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declared versions of the owning handler; empty for the unversioned default.
    pub fn versions(&self) -> &BTreeSet<String> {
        &self.versions
    }

    pub fn is_default(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn is_ignored(&self) -> bool {
        self.invoker.is_none()
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler_type
    }

    pub fn signature(&self) -> Option<MethodSignature> {
        self.invoker.as_ref().map(|invoker| invoker.signature())
    }

    /// Invokes the bound method, `None` when it produced no value.
    pub async fn invoke(&self, args: Arguments) -> Result<Option<Value>, InvokeError> {
        let invoker = self.invoker.as_ref().ok_or_else(|| InvokeError::handler("route is excluded from dispatch"))?;
        match invoker.invoke(args).await? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("versions", &self.versions)
            .field("handler_type", &self.handler_type)
            .field("ignored", &self.is_ignored())
            .finish()
    }
}
