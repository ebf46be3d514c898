//! Version aware method routing.
//!
//! Handlers are registered once at startup through [`Service::routes`], together with the set of
//! versions the handler implements. Several handlers may serve the same path, differing only by version;
//! at most one of them may be unversioned, and that one is the default when a caller gives no version.
//!
//! # Example
//!
//! ```
//! use micro_bridge::router::{MethodRouter, Routes, Service};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! struct Widgets;
//!
//! #[derive(Deserialize)]
//! struct GetWidget {
//!     id: u64,
//! }
//!
//! impl Widgets {
//!     async fn get(&self, args: GetWidget) -> Result<String, String> {
//!         Ok(format!("widget {}", args.id))
//!     }
//! }
//!
//! impl Service for Widgets {
//!     fn routes(routes: &mut Routes<Self>) {
//!         routes.get("/widgets/{id}", |svc: Arc<Self>, args: GetWidget| async move { svc.get(args).await });
//!     }
//! }
//!
//! let router = MethodRouter::builder().register(Arc::new(Widgets), &[]).build().unwrap();
//! assert!(router.resolve(&http::Method::GET, "/widgets/7", None).is_ok());
//! ```

mod arguments;
mod entry;
mod error;
mod method_fn;

pub use arguments::Arguments;
pub use entry::MethodSignature;
pub use entry::RouteEntry;
pub use entry::RouteKey;
pub use error::DispatchError;
pub use error::InvokeError;
pub use error::RouteError;
pub use error::RouterBuildError;
pub use method_fn::Invoke;
pub use method_fn::MethodFn;
pub use method_fn::method_fn;

use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::type_name;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

type InnerRouter<T> = matchit::Router<T>;

/// A handler type that exposes methods to the router.
pub trait Service: Send + Sync + Sized + 'static {
    fn routes(routes: &mut Routes<Self>);
}

/// Collects the route entries of one handler instance.
pub struct Routes<T> {
    instance: Arc<T>,
    versions: BTreeSet<String>,
    entries: Vec<RouteEntry>,
}

impl<T> fmt::Debug for Routes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routes")
            .field("handler", &type_name::<T>())
            .field("versions", &self.versions)
            .field("entries", &self.entries)
            .finish()
    }
}

macro_rules! verb_route {
    ($name:ident, $method:ident) => {
        pub fn $name<F, Fut, A, R, E>(&mut self, path: &str, f: F) -> &mut Self
        where
            F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            A: DeserializeOwned + Send + 'static,
            R: Serialize + Send + 'static,
            E: Display + Send + 'static,
        {
            self.route(Method::$method, path, f)
        }
    };
}

impl<T: Service> Routes<T> {
    fn new(instance: Arc<T>, versions: BTreeSet<String>) -> Self {
        Self { instance, versions, entries: vec![] }
    }

    /// Binds `f` to `method path`; `f` receives the handler instance and the bound arguments.
    pub fn route<F, Fut, A, R, E>(&mut self, method: Method, path: &str, f: F) -> &mut Self
    where
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        let invoker = method_fn(move |args: A| f(Arc::clone(&instance), args));
        self.entries.push(RouteEntry::new(method, path, self.versions.clone(), type_name::<T>(), Arc::new(invoker)));
        self
    }

    verb_route!(get, GET);
    verb_route!(post, POST);
    verb_route!(put, PUT);
    verb_route!(delete, DELETE);
    verb_route!(patch, PATCH);

    /// Declares `method path` as part of the handler but excluded from dispatch.
    pub fn ignore(&mut self, method: Method, path: &str) -> &mut Self {
        self.entries.push(RouteEntry::ignored(method, path, self.versions.clone(), type_name::<T>()));
        self
    }
}

/// Resolves `(method, path, version)` to a [`RouteEntry`].
pub struct MethodRouter {
    inner_router: InnerRouter<Vec<RouteEntry>>,
    len: usize,
}

impl fmt::Debug for MethodRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRouter").field("len", &self.len).finish_non_exhaustive()
    }
}

/// A resolved route with the parameters captured from its path.
#[derive(Debug)]
pub struct Resolved<'router> {
    pub entry: &'router RouteEntry,
    pub params: Vec<(String, String)>,
}

impl MethodRouter {
    pub fn builder() -> MethodRouterBuilder {
        MethodRouterBuilder::new()
    }

    /// Number of registered entries, ignored ones included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finds the entry serving `method path` for `version`.
    ///
    /// With a version, the first entry declaring it wins, and a miss is [`RouteError::NotFound`]. Without
    /// one, the unversioned entry wins; when there is none, a single versioned entry is used and several
    /// are [`RouteError::AmbiguousRoute`]. Paths are case sensitive and versions compare exactly.
    pub fn resolve(&self, method: &Method, path: &str, version: Option<&str>) -> Result<Resolved<'_>, RouteError> {
        let not_found = || RouteError::NotFound {
            method: method.to_string(),
            path: path.to_string(),
            version: version.map(str::to_string),
        };

        let matched = self.inner_router.at(path).map_err(|e| {
            trace!(path, cause = %e, "no route matched");
            not_found()
        })?;

        let mut candidates = matched.value.iter().filter(|entry| !entry.is_ignored() && entry.method() == method);
        let entry = match version {
            Some(version) => candidates.find(|entry| entry.versions().contains(version)),
            None => {
                let candidates = candidates.collect::<Vec<_>>();
                match candidates.iter().find(|entry| entry.is_default()) {
                    Some(entry) => Some(*entry),
                    None if candidates.len() > 1 => {
                        return Err(RouteError::AmbiguousRoute {
                            method: method.to_string(),
                            path: path.to_string(),
                            candidates: candidates.len(),
                        });
                    }
                    None => candidates.first().copied(),
                }
            }
        };

        let entry = entry.ok_or_else(not_found)?;
        let params = matched.params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        trace!(%method, path, version, handler = entry.handler_type(), "route resolved");
        Ok(Resolved { entry, params })
    }

    pub fn resolve_key(&self, key: &RouteKey) -> Result<Resolved<'_>, RouteError> {
        self.resolve(&key.method, &key.path, key.version.as_deref())
    }

    /// Resolves the route, binds its arguments from `body`, path parameters and `query`, and invokes it.
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        version: Option<&str>,
        query: Option<&str>,
        body: &[u8],
    ) -> Result<Option<Value>, DispatchError> {
        let resolved = self.resolve(method, path, version)?;
        let args = Arguments::bind(body, &resolved.params, query)?;
        let result = resolved.entry.invoke(args).await?;
        debug!(%method, path, version, has_result = result.is_some(), "dispatched");
        Ok(result)
    }
}

#[derive(Debug)]
pub struct MethodRouterBuilder {
    data: BTreeMap<String, Vec<RouteEntry>>,
}

impl MethodRouterBuilder {
    fn new() -> Self {
        Self { data: BTreeMap::new() }
    }

    /// Registers every route of `instance` under `versions`; an empty set registers the default handler.
    pub fn register<S: Service>(mut self, instance: Arc<S>, versions: &[&str]) -> Self {
        let versions = versions.iter().map(|v| v.to_string()).collect();
        let mut routes = Routes::new(instance, versions);
        S::routes(&mut routes);
        for entry in routes.entries {
            self = self.entry(entry);
        }
        self
    }

    pub fn entry(mut self, entry: RouteEntry) -> Self {
        self.data.entry(entry.path().to_string()).or_default().push(entry);
        self
    }

    pub fn build(self) -> Result<MethodRouter, RouterBuildError> {
        let mut inner_router = InnerRouter::new();
        let mut len = 0;

        for (path, entries) in self.data {
            check_versions(&path, &entries)?;
            len += entries.len();
            inner_router
                .insert(path.clone(), entries)
                .map_err(|e| RouterBuildError::InvalidPath { path, reason: e.to_string() })?;
        }

        Ok(MethodRouter { inner_router, len })
    }
}

fn check_versions(path: &str, entries: &[RouteEntry]) -> Result<(), RouterBuildError> {
    let mut seen: HashMap<&Method, (bool, HashSet<&str>)> = HashMap::new();

    for entry in entries.iter().filter(|entry| !entry.is_ignored()) {
        let (has_default, versions) = seen.entry(entry.method()).or_default();
        if entry.is_default() {
            if *has_default {
                return Err(RouterBuildError::DuplicateDefault { method: entry.method().to_string(), path: path.to_string() });
            }
            *has_default = true;
        }
        for version in entry.versions() {
            if !versions.insert(version.as_str()) {
                return Err(RouterBuildError::DuplicateVersion {
                    method: entry.method().to_string(),
                    path: path.to_string(),
                    version: version.clone(),
                });
            }
        }
    }
    Ok(())
}
