use anyhow::bail;

/// Turns the upstream provider configured for a forked network into a URL.
///
/// Provider names (such as `alchemy`) only mean something to the host framework, so the host
/// supplies the resolver. `provider_name` is `None` when the configuration doesn't name one and
/// the host's default for the network should be used.
pub trait UpstreamResolver {
    fn resolve(
        &self,
        ecosystem: &str,
        network: &str,
        provider_name: Option<&str>,
    ) -> anyhow::Result<String>;
}

impl<F> UpstreamResolver for F
where
    F: Fn(&str, &str, Option<&str>) -> anyhow::Result<String>,
{
    fn resolve(
        &self,
        ecosystem: &str,
        network: &str,
        provider_name: Option<&str>,
    ) -> anyhow::Result<String> {
        self(ecosystem, network, provider_name)
    }
}

/// A resolver for hosts without named providers: only literal URLs are accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiteralUrlResolver;

impl UpstreamResolver for LiteralUrlResolver {
    fn resolve(
        &self,
        ecosystem: &str,
        network: &str,
        provider_name: Option<&str>,
    ) -> anyhow::Result<String> {
        const SCHEMES: [&str; 4] = ["http://", "https://", "ws://", "wss://"];

        match provider_name {
            Some(url) if SCHEMES.iter().any(|scheme| url.starts_with(scheme)) => {
                Ok(url.to_string())
            }
            Some(name) => bail!(
                "Upstream provider '{name}' of {ecosystem}:{network} is not a URL and there is no resolver for provider names"
            ),
            None => bail!("No upstream provider is configured for {ecosystem}:{network}"),
        }
    }
}
