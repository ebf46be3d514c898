//! Typed route handlers.
//!
//! A route handler is an async function taking one deserializable argument struct and returning a
//! serializable result. [`MethodFn`] erases those types behind [`Invoke`], which the router calls with
//! the body and parameters already merged into [`Arguments`].

use crate::router::arguments::Arguments;
use crate::router::entry::MethodSignature;
use crate::router::error::InvokeError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::type_name;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;

#[async_trait]
pub trait Invoke: Send + Sync {
    /// Runs the handler; `Value::Null` means the handler returned nothing.
    async fn invoke(&self, args: Arguments) -> Result<Value, InvokeError>;

    fn signature(&self) -> MethodSignature;
}

/// a `Fn(Args) -> Future<Output = Result<R, E>>` holder
pub struct MethodFn<F, Args> {
    f: F,
    _phantom: PhantomData<fn(Args)>,
}

impl<F, Args> std::fmt::Debug for MethodFn<F, Args> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodFn").field("args", &type_name::<Args>()).finish_non_exhaustive()
    }
}

pub fn method_fn<F, Fut, Args, R, E>(f: F) -> MethodFn<F, Args>
where
    F: Fn(Args) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    MethodFn { f, _phantom: PhantomData }
}

#[async_trait]
impl<F, Fut, Args, R, E> Invoke for MethodFn<F, Args>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    Args: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    async fn invoke(&self, args: Arguments) -> Result<Value, InvokeError> {
        let args = args.deserialize::<Args>().map_err(InvokeError::bad_request)?;
        let result = (self.f)(args).await.map_err(InvokeError::handler)?;
        serde_json::to_value(result).map_err(InvokeError::handler)
    }

    fn signature(&self) -> MethodSignature {
        MethodSignature { params: type_name::<Args>(), returns: type_name::<R>() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    async fn add(args: Add) -> Result<i64, String> {
        args.a.checked_add(args.b).ok_or_else(|| "overflow".to_string())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_invoke() {
        let invoker = method_fn(add);
        assert_eq!(invoker.invoke(Arguments::from(json!({ "a": 1, "b": 2 }))).await.unwrap(), json!(3));
        assert!(matches!(invoker.invoke(Arguments::from(json!({ "a": "x" }))).await, Err(InvokeError::BadRequest { .. })));
        assert!(matches!(
            invoker.invoke(Arguments::from(json!({ "a": i64::MAX, "b": 1 }))).await,
            Err(InvokeError::Handler { .. })
        ));
        assert!(invoker.signature().params.ends_with("Add"));
        assert_eq!(invoker.signature().returns, "i64");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_unit_result_is_null() {
        let invoker = method_fn(|_: Value| async { Ok::<(), String>(()) });
        assert_eq!(invoker.invoke(Value::Null.into()).await.unwrap(), Value::Null);
    }
}
