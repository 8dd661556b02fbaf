//! Asynchronous read/write handlers and the context they run in.

use std::future::Future;

use async_trait::async_trait;
pub use hap_core::connection::ConnectionId;
use hap_core::status::HapStatus;

use crate::value::CharValue;


/// Who is asking.
///
/// Programmatic access from the hosting application uses [`RequestContext::local`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub connection: Option<ConnectionId>,
    /// Pairing identifier of the verified controller.
    pub controller: Option<String>,
    pub is_admin: bool,
}

impl RequestContext {
    pub fn local() -> Self {
        Self {
            connection: None,
            controller: None,
            is_admin: true,
        }
    }

    pub fn remote(connection: ConnectionId, controller: impl Into<String>, is_admin: bool) -> Self {
        Self {
            connection: Some(connection),
            controller: Some(controller.into()),
            is_admin,
        }
    }
}

/// Produces the current value of a characteristic.
#[async_trait]
pub trait ReadHandler: Send + Sync {
    async fn read(&self, ctx: &RequestContext) -> Result<CharValue, HapStatus>;
}

/// Accepts a new value for a characteristic.
///
/// `Ok(Some(_))` supplies a write-response value.
#[async_trait]
pub trait WriteHandler: Send + Sync {
    async fn write(
        &self,
        value: CharValue,
        ctx: &RequestContext,
    ) -> Result<Option<CharValue>, HapStatus>;
}

/// Validates the `authData` escorting a write to an `aa` characteristic.
pub type AuthorizationHandler = dyn Fn(Option<&str>) -> bool + Send + Sync;

/// Closure adapter returned by [`read_fn`].
pub struct ReadFn<F>(F);

/// Build a [`ReadHandler`] from an async closure.
pub fn read_fn<F, Fut>(f: F) -> ReadFn<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CharValue, HapStatus>> + Send + 'static,
{
    ReadFn(f)
}

#[async_trait]
impl<F, Fut> ReadHandler for ReadFn<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CharValue, HapStatus>> + Send + 'static,
{
    async fn read(&self, ctx: &RequestContext) -> Result<CharValue, HapStatus> {
        (self.0)(ctx.clone()).await
    }
}

/// Closure adapter returned by [`write_fn`].
pub struct WriteFn<F>(F);

/// Build a [`WriteHandler`] from an async closure.
pub fn write_fn<F, Fut>(f: F) -> WriteFn<F>
where
    F: Fn(CharValue, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<CharValue>, HapStatus>> + Send + 'static,
{
    WriteFn(f)
}

#[async_trait]
impl<F, Fut> WriteHandler for WriteFn<F>
where
    F: Fn(CharValue, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<CharValue>, HapStatus>> + Send + 'static,
{
    async fn write(
        &self,
        value: CharValue,
        ctx: &RequestContext,
    ) -> Result<Option<CharValue>, HapStatus> {
        (self.0)(value, ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_handlers() {
        let reader = read_fn(|ctx: RequestContext| async move {
            Ok(CharValue::Bool(ctx.is_admin))
        });
        let ctx = RequestContext::remote(ConnectionId(3), "ctrl", true);
        assert_eq!(reader.read(&ctx).await, Ok(CharValue::Bool(true)));

        let writer = write_fn(|value: CharValue, _ctx| async move {
            match value {
                CharValue::Int(v) if v > 10 => Err(HapStatus::InvalidValueInRequest),
                other => Ok(Some(other)),
            }
        });
        assert_eq!(
            writer.write(CharValue::Int(11), &ctx).await,
            Err(HapStatus::InvalidValueInRequest)
        );
        assert_eq!(
            writer.write(CharValue::Int(1), &ctx).await,
            Ok(Some(CharValue::Int(1)))
        );
    }

    #[test]
    fn local_context_is_admin() {
        let ctx = RequestContext::local();
        assert!(ctx.is_admin);
        assert!(ctx.connection.is_none());
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }
}
