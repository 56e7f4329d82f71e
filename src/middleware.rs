use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{BoxError, Layer, Service};
use tracing::debug;

use crate::{error::RateLimitError, limiter::Limiter};

/// Applies per-key rate limiting to requests.
///
/// The key function maps each request to the key passed to
/// [`Limiter::allow`]. A denied request fails with
/// [`RateLimitError::RateLimitExceeded`] without reaching the inner service.
/// Without a limiter the layer forwards everything untouched.
pub struct RateLimitLayer<K> {
    limiter: Option<Arc<dyn Limiter>>,
    key_fn: Arc<K>,
}

impl<K> Clone for RateLimitLayer<K> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<K> RateLimitLayer<K> {
    pub fn new(limiter: Option<Arc<dyn Limiter>>, key_fn: K) -> Self {
        Self {
            limiter,
            key_fn: Arc::new(key_fn),
        }
    }
}

impl<S, K> Layer<S> for RateLimitLayer<K> {
    type Service = RateLimitService<S, K>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

pub struct RateLimitService<S, K> {
    inner: S,
    limiter: Option<Arc<dyn Limiter>>,
    key_fn: Arc<K>,
}

impl<S: Clone, K> Clone for RateLimitService<S, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<S, K, Req> Service<Req> for RateLimitService<S, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    K: Fn(&Req) -> String,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let Some(limiter) = self.limiter.clone() else {
            return Box::pin(async move { inner.call(req).await.map_err(Into::into) });
        };

        let key = (*self.key_fn)(&req);
        Box::pin(async move {
            if !limiter.allow(&key).await {
                debug!(key = %key, "Request rejected by rate limiter");
                return Err(Box::new(RateLimitError::RateLimitExceeded) as BoxError);
            }
            inner.call(req).await.map_err(Into::into)
        })
    }
}

/// Key function reading `header` from an HTTP request, or `fallback` when the
/// header is missing. Bytes that are not valid UTF-8 are replaced with U+FFFD.
pub fn header_key<B: 'static>(
    header: &'static str,
    fallback: &'static str,
) -> impl Fn(&http::Request<B>) -> String + Send + Sync + 'static {
    move |req: &http::Request<B>| {
        req.headers()
            .get(header)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_else(|| fallback.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLimiter;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    fn counting_echo(
        calls: Arc<AtomicUsize>,
    ) -> tower::util::BoxCloneService<String, String, Infallible> {
        tower::util::BoxCloneService::new(service_fn(move |req: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(format!("handled {}", req))
            }
        }))
    }

    #[tokio::test]
    async fn test_denied_requests_never_reach_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let limiter: Arc<dyn Limiter> = Arc::new(InMemoryLimiter::new(0.001, 2));
        let svc = RateLimitLayer::new(Some(limiter), |req: &String| req.clone())
            .layer(counting_echo(calls.clone()));

        assert_eq!(svc.clone().oneshot("alice".to_string()).await.unwrap(), "handled alice");
        assert_eq!(svc.clone().oneshot("alice".to_string()).await.unwrap(), "handled alice");

        let err = svc.clone().oneshot("alice".to_string()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RateLimitError>(),
            Some(RateLimitError::RateLimitExceeded)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Another key still has its own budget.
        assert_eq!(svc.clone().oneshot("bob".to_string()).await.unwrap(), "handled bob");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_without_limiter_is_passthrough() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = RateLimitLayer::new(None, |_: &String| -> String {
            panic!("key function must not run without a limiter")
        })
        .layer(counting_echo(calls.clone()));

        for _ in 0..50 {
            svc.clone().oneshot("req".to_string()).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_inner_errors_are_forwarded() {
        let limiter: Arc<dyn Limiter> = Arc::new(InMemoryLimiter::new(1.0, 10));
        let failing = service_fn(|_: String| async {
            Err::<String, BoxError>("downstream broke".into())
        });
        let svc = RateLimitLayer::new(Some(limiter), |req: &String| req.clone()).layer(failing);

        let err = svc.oneshot("k".to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "downstream broke");
        assert!(err.downcast_ref::<RateLimitError>().is_none());
    }

    #[test]
    fn test_header_key() {
        let key_fn = header_key::<()>("x-api-key", "anonymous");

        let req = http::Request::builder()
            .header("x-api-key", "team-42")
            .body(())
            .unwrap();
        assert_eq!(key_fn(&req), "team-42");

        let req = http::Request::builder().body(()).unwrap();
        assert_eq!(key_fn(&req), "anonymous");
    }

    #[test]
    fn test_header_key_keeps_non_utf8_callers_apart() {
        let key_fn = header_key::<()>("x-api-key", "anonymous");
        let request = |bytes: &[u8]| {
            http::Request::builder()
                .header("x-api-key", http::HeaderValue::from_bytes(bytes).unwrap())
                .body(())
                .unwrap()
        };

        let first = key_fn(&request(b"team-\xff-a"));
        let second = key_fn(&request(b"team-\xff-b"));
        assert_eq!(first, "team-\u{fffd}-a");
        assert_ne!(first, second);
        assert_ne!(first, "anonymous");
    }
}
