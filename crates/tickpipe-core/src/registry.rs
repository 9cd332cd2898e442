use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::adapters::SourceAdapter;
use crate::{AssetClass, SourceId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("source '{0}' is registered twice")]
    Duplicate(SourceId),
    #[error("source '{0}' is not registered")]
    Unknown(SourceId),
    #[error("source '{source_id}' does not serve asset class '{asset_class}'")]
    Unsupported {
        source_id: SourceId,
        asset_class: AssetClass,
    },
}

/// Adapters keyed by id plus the ordered asset-class routing table.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceId, Arc<dyn SourceAdapter>>,
    routes: BTreeMap<AssetClass, Vec<SourceId>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<(), RegistryError> {
        let id = adapter.id().clone();
        if self.adapters.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.adapters.insert(id, adapter);
        Ok(())
    }

    /// Sets the preference order of sources for `asset_class`.
    pub fn route(
        &mut self,
        asset_class: AssetClass,
        sources: Vec<SourceId>,
    ) -> Result<(), RegistryError> {
        for source in &sources {
            let adapter = self
                .adapters
                .get(source)
                .ok_or_else(|| RegistryError::Unknown(source.clone()))?;
            if !adapter.supports(asset_class) {
                return Err(RegistryError::Unsupported {
                    source_id: source.clone(),
                    asset_class,
                });
            }
        }
        self.routes.insert(asset_class, sources);
        Ok(())
    }

    pub fn get(&self, id: &SourceId) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(id).cloned()
    }

    /// Sources for `asset_class` in routing order. Falls back to every
    /// registered adapter that supports the class, sorted by id.
    pub fn sources_for(&self, asset_class: AssetClass) -> Vec<SourceId> {
        if let Some(route) = self.routes.get(&asset_class) {
            return route.clone();
        }

        let mut ids: Vec<SourceId> = self
            .adapters
            .values()
            .filter(|adapter| adapter.supports(asset_class))
            .map(|adapter| adapter.id().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedSource;

    fn simulated(id: &str, classes: &[AssetClass]) -> Arc<dyn SourceAdapter> {
        Arc::new(
            SimulatedSource::builder(SourceId::parse(id).expect("id"))
                .asset_classes(classes)
                .build(),
        )
    }

    #[test]
    fn explicit_route_order_wins_over_fallback() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(simulated("alpha", &[AssetClass::Crypto]))
            .expect("register");
        registry
            .register(simulated("beta", &[AssetClass::Crypto]))
            .expect("register");

        assert_eq!(
            registry.sources_for(AssetClass::Crypto),
            vec![SourceId::parse("alpha").expect("id"), SourceId::parse("beta").expect("id")]
        );

        registry
            .route(
                AssetClass::Crypto,
                vec![SourceId::parse("beta").expect("id"), SourceId::parse("alpha").expect("id")],
            )
            .expect("route");
        assert_eq!(
            registry.sources_for(AssetClass::Crypto)[0],
            SourceId::parse("beta").expect("id")
        );
    }

    #[test]
    fn rejects_duplicates_and_unsupported_routes() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(simulated("alpha", &[AssetClass::Equity]))
            .expect("register");

        assert!(matches!(
            registry.register(simulated("alpha", &[AssetClass::Equity])),
            Err(RegistryError::Duplicate(_))
        ));
        assert!(matches!(
            registry.route(AssetClass::Forex, vec![SourceId::parse("alpha").expect("id")]),
            Err(RegistryError::Unsupported { .. })
        ));
        assert!(matches!(
            registry.route(AssetClass::Forex, vec![SourceId::parse("nope").expect("id")]),
            Err(RegistryError::Unknown(_))
        ));
    }
}
