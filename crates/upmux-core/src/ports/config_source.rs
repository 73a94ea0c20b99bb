//! Desired-state source consumed by the supervisor.

use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::{ConfigSnapshot, ServerConfig};

/// Publishes versioned configuration snapshots.
///
/// A fresh subscriber observes the current snapshot immediately and every
/// later one. Intermediate versions may be skipped; the latest always wins.
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> Arc<ConfigSnapshot>;

    fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>>;

    fn find_server(&self, name: &str) -> Option<Arc<ServerConfig>> {
        self.current().server(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        Source {}
        impl ConfigSource for Source {
            fn current(&self) -> Arc<ConfigSnapshot>;
            fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>>;
        }
    }

    #[test]
    fn test_find_server_reads_current_snapshot() {
        let snapshot = Arc::new(ConfigSnapshot::from_servers(
            7,
            vec![ServerConfig::remote("svc-a", "http://x")],
        ));
        let mut source = MockSource::new();
        source
            .expect_current()
            .times(2)
            .returning(move || Arc::clone(&snapshot));

        assert_eq!(
            source.find_server("svc-a").unwrap().url.as_deref(),
            Some("http://x")
        );
        assert!(source.find_server("svc-b").is_none());
    }
}
