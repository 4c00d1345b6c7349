//! Name lookup seam: turn a client identity into the server pair to dial.

use std::net::SocketAddr;

use async_trait::async_trait;

/// Addresses of the two servers backing one identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub primary: SocketAddr,
    pub standby: SocketAddr,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, identity: &str) -> anyhow::Result<Endpoints>;
}

/// Resolver that hands every identity the same fixed pair.
#[derive(Clone, Debug)]
pub struct StaticResolver {
    endpoints: Endpoints,
}

impl StaticResolver {
    pub fn new(primary: SocketAddr, standby: SocketAddr) -> Self {
        Self {
            endpoints: Endpoints { primary, standby },
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _identity: &str) -> anyhow::Result<Endpoints> {
        Ok(self.endpoints)
    }
}
