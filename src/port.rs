use std::collections::HashMap;

use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::error::BrokerError;
use crate::model::SessionKey;

/// Binds a listener to `127.0.0.1:0`, reads the OS-assigned port back, then
/// drops the listener. There is a small TOCTOU window between that drop and
/// whatever rebinds the port (the SSH tunnel's `-L` forward); callers must
/// bind promptly.
pub struct PortAllocator;

impl PortAllocator {
    pub async fn allocate() -> Result<u16, BrokerError> {
        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|err| BrokerError::tunnel(format!("failed to allocate port: {err}")))?;
        let port = listener.local_addr().map_err(|err| BrokerError::tunnel(format!("failed to read allocated port: {err}")))?.port();
        drop(listener);
        Ok(port)
    }
}

/// Current port assignment per session, exposed read-only to ProxyRegistry.
/// Last-writer-wins per `SessionKey`; lookup never blocks a writer.
pub struct PortRegistry {
    ports: RwLock<HashMap<SessionKey, u16>>,
}

impl PortRegistry {
    pub fn new() -> PortRegistry {
        PortRegistry { ports: RwLock::new(HashMap::new()) }
    }

    pub async fn set(&self, key: &SessionKey, port: u16) {
        self.ports.write().await.insert(key.clone(), port);
    }

    pub async fn get(&self, key: &SessionKey) -> Option<u16> {
        self.ports.read().await.get(key).copied()
    }

    /// Removes the entry; the port itself was already returned to the OS by
    /// `PortAllocator` (nothing here owns the socket).
    pub async fn remove(&self, key: &SessionKey) {
        self.ports.write().await.remove(key);
    }

    pub async fn is_injective(&self) -> bool {
        let ports = self.ports.read().await;
        let mut seen = std::collections::HashSet::new();
        ports.values().all(|port| seen.insert(*port))
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ide;

    #[tokio::test]
    async fn allocate_returns_distinct_ports() {
        let a = PortAllocator::allocate().await.unwrap();
        let b = PortAllocator::allocate().await.unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[tokio::test]
    async fn registry_is_injective_by_construction() {
        let registry = PortRegistry::new();
        let k1 = SessionKey::encode("alice", "gemini", Ide::Vscode);
        let k2 = SessionKey::encode("bob", "gemini", Ide::Rstudio);
        registry.set(&k1, 9001).await;
        registry.set(&k2, 9002).await;
        assert!(registry.is_injective().await);
        assert_eq!(registry.get(&k1).await, Some(9001));
    }

    #[tokio::test]
    async fn remove_clears_assignment() {
        let registry = PortRegistry::new();
        let key = SessionKey::encode("alice", "gemini", Ide::Vscode);
        registry.set(&key, 9001).await;
        registry.remove(&key).await;
        assert_eq!(registry.get(&key).await, None);
    }
}
