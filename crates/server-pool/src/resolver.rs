use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};

/// Resolves a `host:port` target to socket addresses.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, target: &str) -> anyhow::Result<Vec<SocketAddr>>;
}

pub struct HickoryResolver {
    inner: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
        })
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve(&self, target: &str) -> anyhow::Result<Vec<SocketAddr>> {
        let (host, port) = split_target(target)?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let ips = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|err| anyhow::anyhow!("failed to query DNS for {host}: {err}"))?;
        Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

fn split_target(target: &str) -> anyhow::Result<(&str, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("target {target} has no port"))?;
    let port = port
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid port in {target}: {err}"))?;
    Ok((host, port))
}

/// A resolver answering from a fixed, settable list. Useful in tests and
/// for pointing a daemon at an explicit endpoint.
#[derive(Default)]
pub struct StaticResolver {
    addrs: Mutex<Option<Vec<SocketAddr>>>,
}

impl StaticResolver {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs: Mutex::new(Some(addrs)),
        }
    }

    pub fn set(&self, addrs: Vec<SocketAddr>) {
        *self.addrs.lock() = Some(addrs);
    }

    /// Make subsequent resolutions fail until `set` is called again.
    pub fn fail(&self) {
        *self.addrs.lock() = None;
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, target: &str) -> anyhow::Result<Vec<SocketAddr>> {
        self.addrs
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no addresses for {target}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_splitting() {
        assert_eq!(
            split_target("dynamodb.us-east-1.amazonaws.com:443").unwrap(),
            ("dynamodb.us-east-1.amazonaws.com", 443)
        );
        assert!(split_target("noport").is_err());
        assert!(split_target("host:notanumber").is_err());
    }
}
