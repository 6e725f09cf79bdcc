//! Keyed hand-off of accepted connections to listeners

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{PacketConn, PacketListener, TransportError, TransportResult};

const BACKLOG: usize = 8;

type Route = mpsc::Sender<Box<dyn PacketConn>>;

/// Listeners registered under a key (an address or a tunnel id)
pub struct RouteTable<K> {
    routes: Arc<StdMutex<HashMap<K, Route>>>,
}

impl<K> Clone for RouteTable<K> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
        }
    }
}

impl<K> Default for RouteTable<K> {
    fn default() -> Self {
        Self {
            routes: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

impl<K: Debug> Debug for RouteTable<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = match self.routes.lock() {
            Ok(routes) => routes.keys().map(|k| format!("{:?}", k)).collect(),
            Err(_) => Vec::new(),
        };
        f.debug_struct("RouteTable").field("keys", &keys).finish()
    }
}

impl<K> RouteTable<K>
where
    K: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static,
{
    pub fn register(&self, key: K) -> TransportResult<RoutedListener<K>> {
        let (tx, rx) = mpsc::channel(BACKLOG);
        {
            let mut routes = self
                .routes
                .lock()
                .map_err(|_| TransportError::ConnectionError("route table poisoned".into()))?;
            if routes.contains_key(&key) {
                return Err(TransportError::ConnectionError(format!(
                    "{} is already registered",
                    key
                )));
            }
            routes.insert(key.clone(), tx.clone());
        }

        Ok(RoutedListener {
            key,
            tx,
            rx: Mutex::new(rx),
            table: self.clone(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.routes
            .lock()
            .map(|routes| routes.contains_key(key))
            .unwrap_or(false)
    }

    /// Deliver a connection to the listener registered under `key`
    pub async fn route(&self, key: &K, conn: Box<dyn PacketConn>) -> TransportResult<()> {
        let route = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(key).cloned());

        match route {
            Some(tx) => tx
                .send(conn)
                .await
                .map_err(|_| TransportError::ListenerClosed),
            None => Err(TransportError::ConnectionError(format!(
                "no listener for {}",
                key
            ))),
        }
    }

    fn unregister(&self, key: &K, tx: &Route) {
        if let Ok(mut routes) = self.routes.lock() {
            if routes.get(key).is_some_and(|current| current.same_channel(tx)) {
                routes.remove(key);
                debug!("Unregistered listener for {}", key);
            }
        }
    }
}

/// Listener fed by a [`RouteTable`]; unregisters itself on close or drop
pub struct RoutedListener<K>
where
    K: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static,
{
    key: K,
    tx: Route,
    rx: Mutex<mpsc::Receiver<Box<dyn PacketConn>>>,
    table: RouteTable<K>,
    cancel: CancellationToken,
}

impl<K> RoutedListener<K>
where
    K: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Debug for RoutedListener<K>
where
    K: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedListener")
            .field("key", &self.key)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl<K> PacketListener for RoutedListener<K>
where
    K: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static,
{
    async fn accept(&self) -> TransportResult<Box<dyn PacketConn>> {
        let mut rx = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::ListenerClosed),
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ListenerClosed),
            conn = rx.recv() => conn.ok_or(TransportError::ListenerClosed),
        }
    }

    fn local_addr(&self) -> String {
        self.key.to_string()
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.table.unregister(&self.key, &self.tx);
    }
}

impl<K> Drop for RoutedListener<K>
where
    K: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
        self.table.unregister(&self.key, &self.tx);
    }
}
