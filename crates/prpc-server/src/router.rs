//! `"Service.Method"` dispatch table.
//!
//! Handlers are registered explicitly with their argument and reply types;
//! the router erases those types behind one boxed signature that turns a
//! request message into a response frame.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::future::BoxFuture;
use prpc_common::{Codec, Message, PrpcError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Outcome of one handler run: reply frame or error text for the caller.
type Handler = Arc<dyn Fn(Message, Codec) -> BoxFuture<'static, Reply> + Send + Sync>;

type Reply = std::result::Result<Vec<u8>, String>;

#[derive(Default)]
pub struct Router {
    handlers: RwLock<HashMap<String, Handler>>,
    calls: Mutex<HashMap<String, u64>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `service.method`.
    ///
    /// # Errors
    ///
    /// `InvalidOption` if either name is empty or contains a `.`, or if the
    /// method already has a handler.
    pub fn add<A, R, F, Fut>(&self, service: &str, method: &str, handler: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, String>> + Send + 'static,
    {
        for name in [service, method] {
            if name.is_empty() || name.contains('.') {
                return Err(PrpcError::InvalidOption(format!("invalid name {:?}", name)));
            }
        }

        let key = format!("{}.{}", service, method);
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&key) {
            return Err(PrpcError::InvalidOption(format!("{} registered twice", key)));
        }

        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |request: Message, codec: Codec| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = request
                    .unpack(codec)
                    .map_err(|e| format!("decode arguments: {}", e))?;
                let reply = handler(args).await?;
                Message::pack(request.seqno(), request.service_method(), &reply, codec)
                    .map_err(|e| format!("encode reply: {}", e))
            }) as BoxFuture<'static, _>
        });

        tracing::debug!(method = %key, "handler registered");
        handlers.insert(key, erased);
        Ok(())
    }

    /// Distinct service names with at least one handler.
    pub fn services(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers
            .keys()
            .filter_map(|key| key.split_once('.').map(|(service, _)| service.to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Runs the handler for `request` and frames the response.
    ///
    /// Every failure short of framing the error itself becomes an error
    /// response, so the connection stays usable.
    pub async fn dispatch(&self, request: Message, codec: Codec) -> Result<Vec<u8>> {
        let seq = request.seqno();
        let service_method = request.service_method().to_string();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&service_method)
            .cloned();

        let outcome = match handler {
            Some(handler) => {
                *self.lock_calls().entry(service_method.clone()).or_insert(0) += 1;
                handler(request, codec).await
            }
            None => Err(format!("can't find method {}", service_method)),
        };

        match outcome {
            Ok(frame) => Ok(frame),
            Err(err) => {
                tracing::debug!(method = %service_method, seq, error = %err, "call failed");
                Message::pack_error(seq, &service_method, &err)
            }
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatched calls per `"Service.Method"`.
    pub fn method_calls(&self) -> HashMap<String, u64> {
        self.lock_calls().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODEC: Codec = Codec::MsgPack;

    fn request<T: Serialize>(seq: u16, method: &str, args: &T) -> Message {
        let frame = Message::pack(seq, method, args, CODEC).unwrap();
        futures::executor::block_on(Message::read_from(&mut frame.as_slice())).unwrap()
    }

    fn response(frame: Vec<u8>) -> Message {
        futures::executor::block_on(Message::read_from(&mut frame.as_slice())).unwrap()
    }

    fn arith() -> Router {
        let router = Router::new();
        router
            .add("Arith", "Multiply", |(a, b): (i64, i64)| async move { Ok(a * b) })
            .unwrap();
        router
            .add("Arith", "Divide", |(a, b): (i64, i64)| async move {
                if b == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(a / b)
                }
            })
            .unwrap();
        router
    }

    #[tokio::test]
    async fn test_dispatch_reply() {
        let router = arith();
        let frame = router
            .dispatch(request(9, "Arith.Multiply", &(2i64, 3i64)), CODEC)
            .await
            .unwrap();
        let msg = response(frame);
        assert_eq!(msg.seqno(), 9);
        assert_eq!(msg.service_method(), "Arith.Multiply");
        assert_eq!(msg.unpack::<i64>(CODEC).unwrap(), 6);
        assert_eq!(router.method_calls()["Arith.Multiply"], 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_response() {
        let router = arith();
        let frame = router
            .dispatch(request(1, "Arith.Divide", &(1i64, 0i64)), CODEC)
            .await
            .unwrap();
        assert_eq!(response(frame).remote_error(), Some("divide by zero"));
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_args() {
        let router = arith();
        let frame = router
            .dispatch(request(2, "Arith.Pow", &(1i64, 2i64)), CODEC)
            .await
            .unwrap();
        assert_eq!(
            response(frame).remote_error(),
            Some("can't find method Arith.Pow")
        );
        assert!(router.method_calls().get("Arith.Pow").is_none());

        let frame = router
            .dispatch(request(3, "Arith.Multiply", &"six"), CODEC)
            .await
            .unwrap();
        let err = response(frame).remote_error().unwrap().to_string();
        assert!(err.starts_with("decode arguments"), "{}", err);
    }

    #[test]
    fn test_registration_rules() {
        let router = arith();
        let dup = router.add("Arith", "Multiply", |x: i64| async move { Ok(x) });
        assert!(matches!(dup, Err(PrpcError::InvalidOption(_))));
        assert!(router.add("Ar.ith", "X", |x: i64| async move { Ok(x) }).is_err());
        assert!(router.add("Arith", "", |x: i64| async move { Ok(x) }).is_err());

        router.add("Echo", "Say", |s: String| async move { Ok(s) }).unwrap();
        assert_eq!(router.services(), vec!["Arith", "Echo"]);
    }
}
