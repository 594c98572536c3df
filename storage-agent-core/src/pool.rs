use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::client::{self, UnifiedClient};
use crate::error::{AgentError, Result};
use crate::transport::ConnectOptions;

/// Builds authenticated clients for the pool.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(&self) -> Result<UnifiedClient>;
}

/// Connector establishing real SSH sessions from fixed options.
pub struct SshConnector {
    options: ConnectOptions,
}

impl SshConnector {
    pub fn new(options: ConnectOptions) -> Self {
        SshConnector { options }
    }
}

#[async_trait]
impl ClientConnector for SshConnector {
    async fn connect(&self) -> Result<UnifiedClient> {
        client::connect(self.options.clone()).await
    }
}

struct PoolState {
    free: Vec<UnifiedClient>,
    current_size: usize,
    closed: bool,
}

struct PoolInner {
    connector: Box<dyn ClientConnector>,
    min_size: usize,
    max_size: usize,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

/// A bounded pool of authenticated clients for one array endpoint.
///
/// Checkouts beyond `max_size` wait cooperatively for a slot. Clients are
/// created lazily, probed for liveness on checkout, and returned on every
/// exit path through the [`PooledClient`] guard.
#[derive(Clone)]
pub struct SshPool {
    inner: Arc<PoolInner>,
}

impl SshPool {
    pub fn new(connector: Box<dyn ClientConnector>, min_size: usize, max_size: usize) -> SshPool {
        let max_size = max_size.max(1);
        SshPool {
            inner: Arc::new(PoolInner {
                connector,
                min_size,
                max_size,
                slots: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    current_size: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn min_size(&self) -> usize {
        self.inner.min_size
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Connections currently owned by the pool (free or checked out).
    pub fn current_size(&self) -> usize {
        self.inner.state.lock().unwrap().current_size
    }

    /// Borrow a client, waiting for a slot when all are in use.
    ///
    /// A free client is re-validated before it is handed out; dead ones
    /// are dropped and replaced. When replacement fails the freed slot is
    /// not leaked.
    pub async fn get(&self) -> Result<PooledClient> {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::InternalSystem("connection pool is shut down".to_string()))?;

        let candidate = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(AgentError::InternalSystem(
                    "connection pool is shut down".to_string(),
                ));
            }
            state.free.pop()
        };

        let client = match candidate {
            Some(client) if client.is_active() => client,
            Some(stale) => {
                debug!(
                    current = self.current_size(),
                    "a pooled client is inactive, creating a new one"
                );
                // Drop the dead client and give back its slot before the
                // replacement attempt, so a failed create cannot leak it.
                drop(stale);
                self.inner.state.lock().unwrap().current_size -= 1;
                self.create().await?
            }
            None => self.create().await?,
        };

        Ok(PooledClient {
            client: Some(client),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn create(&self) -> Result<UnifiedClient> {
        let client = self.inner.connector.connect().await?;
        self.inner.state.lock().unwrap().current_size += 1;
        Ok(client)
    }

    /// Close every free client and refuse further checkouts. Clients
    /// still checked out are closed when their guards drop.
    pub async fn shutdown(&self) {
        let drained: Vec<UnifiedClient> = {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            state.current_size -= state.free.len();
            state.free.drain(..).collect()
        };
        self.inner.slots.close();
        for mut client in drained {
            client.close().await;
        }
    }
}

/// A checked-out client. Dropping the guard returns the client to the
/// pool (or closes it when the pool shrank or shut down) and frees the
/// slot for waiters.
pub struct PooledClient {
    client: Option<UnifiedClient>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    /// Close this client instead of returning it to the pool.
    pub async fn remove(mut self) {
        if let Some(mut client) = self.client.take() {
            client.close().await;
            self.pool.state.lock().unwrap().current_size -= 1;
        }
    }
}

impl Deref for PooledClient {
    type Target = UnifiedClient;

    fn deref(&self) -> &UnifiedClient {
        self.client.as_ref().expect("client already removed")
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut UnifiedClient {
        self.client.as_mut().expect("client already removed")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let mut state = self.pool.state.lock().unwrap();
            if state.closed || state.current_size > self.pool.max_size {
                // Dropping the client tears the session down.
                state.current_size -= 1;
            } else {
                state.free.push(client);
            }
        }
    }
}
