//! Backend selection
//!
//! Exactly one backend is active per process: the factory consumes the
//! configuration once and hands back a single boxed bus. There is no path
//! to a second live backend short of calling the factory twice, which
//! nothing in the codebase does.

use std::str::FromStr;
use std::sync::Arc;

use crate::memory::MemoryBus;
use crate::nats::NatsBus;
use crate::retry::RetryPolicy;
use crate::traits::MessageBus;
use crate::{BusError, BusResult};

/// Supported bus backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackendKind {
    /// NATS broker (production and local development)
    Nats,
    /// In-process broadcast bus (tests, single-process demos)
    Memory,
}

impl FromStr for BusBackendKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(BusBackendKind::Nats),
            "memory" => Ok(BusBackendKind::Memory),
            other => Err(BusError::UnknownBackend(other.to_string())),
        }
    }
}

/// Create and connect the configured backend.
///
/// `nats_url` is only consulted for [`BusBackendKind::Nats`].
pub async fn create_bus(
    kind: BusBackendKind,
    nats_url: &str,
    retry: RetryPolicy,
) -> BusResult<Arc<dyn MessageBus>> {
    match kind {
        BusBackendKind::Nats => Ok(Arc::new(NatsBus::connect(nats_url, retry).await?)),
        BusBackendKind::Memory => Ok(Arc::new(MemoryBus::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("nats".parse::<BusBackendKind>().unwrap(), BusBackendKind::Nats);
        assert_eq!(
            " Memory ".parse::<BusBackendKind>().unwrap(),
            BusBackendKind::Memory
        );
    }

    #[test]
    fn unknown_backend_rejected() {
        assert!("solace".parse::<BusBackendKind>().is_err());
        assert!("".parse::<BusBackendKind>().is_err());
    }

    #[tokio::test]
    async fn memory_backend_constructs() {
        let bus = create_bus(BusBackendKind::Memory, "", RetryPolicy::immediate(1))
            .await
            .unwrap();
        assert!(bus.is_connected().await);
    }
}
