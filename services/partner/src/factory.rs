use crate::heygen_adapter::HeyGenAdapter;
use partner_core::avatar::AvatarProvider;
use partner_core::dialogue::DialogueService;
use partner_core::llm::ProviderSelection;
use partner_core::orchestrator::SessionFactory;
use partner_core::persona::Persona;
use secrecy::SecretString;
use std::sync::Arc;

/// Builds the live provider clients for every new session.
pub struct LiveSessionFactory {
    provider: ProviderSelection,
    heygen_api_key: SecretString,
}

impl LiveSessionFactory {
    pub fn new(provider: ProviderSelection, heygen_api_key: SecretString) -> Self {
        tracing::info!(
            "dialogue provider: {} ({})",
            provider.kind().as_str(),
            provider.model()
        );
        Self {
            provider,
            heygen_api_key,
        }
    }
}

impl SessionFactory for LiveSessionFactory {
    fn dialogue(&self, persona: &Persona) -> Arc<DialogueService> {
        Arc::new(DialogueService::new(self.provider.build(), persona))
    }

    fn avatar_provider(&self) -> Arc<dyn AvatarProvider> {
        Arc::new(HeyGenAdapter::from_api_key(&self.heygen_api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partner_core::llm::ProviderCredential;

    #[test]
    fn every_session_gets_fresh_services_for_the_configured_provider() {
        let selection = ProviderSelection::from_credentials(
            None,
            Some(ProviderCredential::new("claude-key", "claude-test")),
        )
        .unwrap();
        let factory = LiveSessionFactory::new(selection, SecretString::from("heygen-key"));
        let persona = Persona::default();

        let first = factory.dialogue(&persona);
        let second = factory.dialogue(&persona);

        assert_eq!(first.provider_name(), "claude");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.instructions().contains(&persona.name));
    }
}
