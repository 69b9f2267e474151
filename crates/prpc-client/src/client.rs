use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use prpc_common::{PrpcError, Result};
use prpc_registry::Registry;
use tokio::sync::OnceCell;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::connection::ConnectionConfig;
use crate::options::{ServiceOption, ServiceOptions};
use crate::service::{RetryPolicy, ServiceClient};

/// Configuration shared by every service client of a [`Client`].
///
/// # Default Configuration
///
/// - `connection`: [`ConnectionConfig::default`]
/// - `breaker`: [`BreakerConfig::default`]
/// - `retry`: three attempts on the same endpoint
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
}

type Slot = Arc<OnceCell<Arc<ServiceClient>>>;

/// Process-wide entry point: hands out [`ServiceClient`]s, one per distinct
/// `(service, group, options)`.
///
/// The map lock is held only to find or insert a slot. Subscribing happens
/// outside it, so a slow registry answer for one service does not hold up
/// lookups of another; concurrent requests for the same configuration wait
/// on the same slot and subscribe once.
pub struct Client {
    registry: Arc<Registry>,
    config: ClientConfig,
    breakers: Arc<BreakerRegistry>,
    services: Mutex<HashMap<String, Slot>>,
}

impl Client {
    pub fn new(registry: Arc<Registry>, config: ClientConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        Self {
            registry,
            config,
            breakers,
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the service client for `(service, group, options)`, creating
    /// and subscribing it on first use.
    ///
    /// # Errors
    ///
    /// - `InvalidOption` if the options do not resolve; nothing is created
    /// - `Registry` if the subscription fails; a later call tries again
    pub async fn service<I>(
        &self,
        service: &str,
        group: &str,
        options: I,
    ) -> Result<Arc<ServiceClient>>
    where
        I: IntoIterator<Item = ServiceOption>,
    {
        let options = ServiceOptions::resolve(options)?;
        let fingerprint = options.fingerprint(service, group);

        let slot = {
            let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
            services.entry(fingerprint.clone()).or_default().clone()
        };

        let client = slot
            .get_or_try_init(|| async {
                let client = Arc::new(ServiceClient::new(
                    service,
                    group,
                    options,
                    self.config.connection.clone(),
                    self.config.retry,
                    self.breakers.clone(),
                ));

                tracing::info!(service, group, fingerprint = %fingerprint, "subscribe service");
                let nodes = self
                    .registry
                    .subscribe(service, group, &fingerprint, client.clone())
                    .await;
                match nodes {
                    Ok(nodes) => {
                        tracing::info!(
                            service,
                            group,
                            nodes = nodes.len(),
                            endpoints = client.endpoints().len(),
                            "service subscribed"
                        );
                        Ok(client)
                    }
                    Err(err) => {
                        client.close().await;
                        Err(PrpcError::from(err))
                    }
                }
            })
            .await?;
        Ok(client.clone())
    }

    /// Service clients created so far.
    pub fn services(&self) -> Vec<Arc<ServiceClient>> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    /// Closes the registry, then every service client.
    pub async fn close(&self) {
        self.registry.close().await;
        let services: Vec<Slot> = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in services {
            if let Some(client) = slot.get() {
                client.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SelectType;
    use prpc_registry::MemoryRemote;

    fn client() -> Client {
        let registry = Arc::new(Registry::new(Arc::new(MemoryRemote::new())));
        Client::new(registry, ClientConfig::default())
    }

    #[tokio::test]
    async fn test_same_options_same_instance() {
        let client = client();
        let a = client.service("Arith", "zone1", []).await.unwrap();
        let b = client
            .service("Arith", "zone1", [ServiceOption::Version("v1.0".to_string())])
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(client.services().len(), 1);
    }

    #[tokio::test]
    async fn test_each_option_gives_new_instance() {
        let client = client();
        let base = client.service("Arith", "zone1", []).await.unwrap();
        let variants = [
            vec![ServiceOption::VersionAll],
            vec![ServiceOption::Index(1)],
            vec![ServiceOption::SelectType(SelectType::RoundRobin)],
        ];
        for options in variants {
            let other = client.service("Arith", "zone1", options).await.unwrap();
            assert!(!Arc::ptr_eq(&base, &other));
        }
        assert_eq!(client.services().len(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_requests_subscribe_once() {
        let client = Arc::new(client());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.service("Arith", "zone1", []).await.unwrap() })
            })
            .collect();

        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap());
        }
        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_invalid_option_creates_nothing() {
        let client = client();
        let err = client
            .service("Arith", "zone1", [ServiceOption::Index(-1)])
            .await
            .unwrap_err();
        assert!(matches!(err, PrpcError::InvalidOption(_)));
        assert!(client.services().is_empty());
    }

    #[tokio::test]
    async fn test_service_after_close_fails() {
        let client = client();
        client.close().await;
        let err = client.service("Arith", "zone1", []).await.unwrap_err();
        assert!(matches!(err, PrpcError::Registry(_)));
    }
}
