use std::future::Future;
use std::sync::Arc;

use crate::failure::Failure;
use crate::value::{Args, Kwargs, Value};

/// Outcome of running a [`Callable`]
pub type CallResult = std::result::Result<Value, Failure>;

/// A function that can be published and invoked by remote peers
///
/// Implementations receive positional and keyword arguments and either
/// return a value or a serializable [`Failure`].
#[async_trait::async_trait]
pub trait Callable: Send + Sync + 'static {
    async fn call(&self, args: Args, kwargs: Kwargs) -> CallResult;
}

/// Adapter turning an async closure into a [`Callable`]
pub struct FnCallable<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Callable for FnCallable<F>
where
    F: Fn(Args, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    async fn call(&self, args: Args, kwargs: Kwargs) -> CallResult {
        (self.0)(args, kwargs).await
    }
}

/// Wrap an async closure as a shareable callable
///
/// ```
/// use constellation_rpc::{callable, Failure};
///
/// let add = callable::from_fn(|args, _kwargs| async move {
///     let a = args.first().and_then(|v| v.as_i64());
///     let b = args.get(1).and_then(|v| v.as_i64());
///     match (a, b) {
///         (Some(a), Some(b)) => Ok((a + b).into()),
///         _ => Err(Failure::invalid_arguments("add expects two integers")),
///     }
/// });
/// # let _ = add;
/// ```
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Callable>
where
    F: Fn(Args, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    Arc::new(FnCallable(f))
}
