//! Provider client registry
//!
//! Builds one adapter per configured provider, with the header-rewrite rules
//! compiled alongside it. A registry is immutable once built; configuration
//! reloads construct a fresh one and swap it in with the routing snapshot.

use std::{collections::HashMap, sync::Arc, time::Duration};

use drover_common::{
    Message, ProviderConfig, ProviderId,
    provider::BackendConfig,
};

use crate::{
    client::ProviderClient,
    error::BuildError,
    mailgun::MailgunClient,
    mandrill::MandrillClient,
    rewrite::{CompiledRule, apply_rewrites, compile_rules},
    workspace::WorkspaceClient,
};

/// A provider adapter plus its compiled rewrite policy
#[derive(Debug, Clone)]
pub struct RegisteredProvider {
    pub client: Arc<dyn ProviderClient>,
    rewrites: Arc<Vec<CompiledRule>>,
}

impl RegisteredProvider {
    /// Wrap an already-constructed client, compiling its rewrite rules
    ///
    /// # Errors
    /// If a rewrite rule fails to compile
    pub fn new(client: Arc<dyn ProviderClient>) -> Result<Self, BuildError> {
        let rewrites = compile_rules(&client.config().header_rewrites)?;
        Ok(Self {
            client,
            rewrites: Arc::new(rewrites),
        })
    }

    /// Apply this provider's header rewrites to a message in place
    pub fn rewrite_headers(&self, message: &mut Message) {
        apply_rewrites(&mut message.headers, &self.rewrites);
    }
}

/// All adapters for one configuration snapshot
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, RegisteredProvider>,
}

impl ProviderRegistry {
    /// Build adapters for every configured provider
    ///
    /// # Errors
    /// If any adapter or rewrite rule fails to construct
    pub fn build(configs: &[ProviderConfig], timeout: Duration) -> Result<Self, BuildError> {
        let mut providers = HashMap::with_capacity(configs.len());

        for config in configs {
            let client: Arc<dyn ProviderClient> = match &config.backend {
                BackendConfig::Workspace { .. } => {
                    Arc::new(WorkspaceClient::new(config.clone(), timeout)?)
                }
                BackendConfig::Mailgun { .. } => {
                    Arc::new(MailgunClient::new(config.clone(), timeout)?)
                }
                BackendConfig::Mandrill { .. } => {
                    Arc::new(MandrillClient::new(config.clone(), timeout)?)
                }
            };

            providers.insert(config.id.clone(), RegisteredProvider::new(client)?);
        }

        Ok(Self { providers })
    }

    /// Build a registry from pre-constructed clients (tests, mocks)
    ///
    /// # Errors
    /// If a client's rewrite rules fail to compile
    pub fn from_clients(
        clients: impl IntoIterator<Item = Arc<dyn ProviderClient>>,
    ) -> Result<Self, BuildError> {
        let mut providers = HashMap::new();
        for client in clients {
            let id = client.id().clone();
            providers.insert(id, RegisteredProvider::new(client)?);
        }
        Ok(Self { providers })
    }

    /// Look up a provider by id
    #[must_use]
    pub fn get(&self, id: &ProviderId) -> Option<&RegisteredProvider> {
        self.providers.get(id)
    }

    /// Iterate over all registered providers
    pub fn iter(&self) -> impl Iterator<Item = (&ProviderId, &RegisteredProvider)> {
        self.providers.iter()
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
