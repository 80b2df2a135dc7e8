use std::{sync::Arc, time::Duration};

use futures_util::future::try_join_all;
use graphfed_planner::{
    EntityPlanner,
    FederationConfig,
    FederationError,
    RepresentationRequest,
    Result,
    SubQuery,
    REPRESENTATIONS_VARIABLE,
};
use graphfed_schema::FederatedEntity;
use indexmap::IndexMap;
use tracing::instrument;
use value::{ConstValue, Name, Variables};

use crate::{ServiceCall, ServiceCaller};

const ENTITIES_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches entities from their owning services with `_entities` queries.
pub struct EntityResolver {
    config: Arc<FederationConfig>,
    caller: Arc<dyn ServiceCaller>,
    planner: EntityPlanner,
}

impl EntityResolver {
    pub fn new(config: Arc<FederationConfig>, caller: Arc<dyn ServiceCaller>) -> Self {
        Self {
            config,
            caller,
            planner: EntityPlanner::new(),
        }
    }

    /// Resolve one entity, the first element of the `_entities` answer.
    pub async fn resolve_entity(
        &self,
        entity: &FederatedEntity,
        representation: RepresentationRequest,
    ) -> Result<ConstValue> {
        self.resolve_entities(entity, &[representation])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                FederationError::DataExtraction(format!("no {} entity returned by the service", entity.type_name))
            })
    }

    /// Resolve a batch of representations of one entity type with a single call.
    #[instrument(err(Debug), skip_all, fields(entity = %entity.type_name), level = "trace")]
    pub async fn resolve_entities(
        &self,
        entity: &FederatedEntity,
        representations: &[RepresentationRequest],
    ) -> Result<Vec<ConstValue>> {
        if entity.service_name.is_empty() {
            return Err(FederationError::Resolution(format!(
                "entity {} has no owning service",
                entity.type_name
            )));
        }
        for representation in representations {
            representation.validate(entity)?;
        }

        let service = self
            .config
            .service(&entity.service_name)
            .ok_or_else(|| FederationError::ServiceNotFound(entity.service_name.clone()))?;
        let query = self.planner.build_representation_query(entity, representations)?;

        let mut variables = Variables::default();
        variables.insert(
            Name::new(REPRESENTATIONS_VARIABLE),
            ConstValue::List(representations.iter().map(RepresentationRequest::to_value).collect()),
        );
        let sub_query = SubQuery {
            path: vec![entity.type_name.clone()],
            ..SubQuery::new(&entity.service_name, query)
                .variables(variables)
                .timeout(ENTITIES_TIMEOUT)
        };

        let response = self.caller.call(ServiceCall::new(service.clone(), sub_query)).await?;
        if let Some(err) = response.error {
            return Err(err);
        }

        match response.data {
            ConstValue::Object(mut data) => match data.swap_remove("_entities") {
                Some(ConstValue::List(entities)) => Ok(entities),
                _ => Err(FederationError::DataExtraction(
                    "response contains no _entities array".to_string(),
                )),
            },
            _ => match response.errors.first() {
                Some(err) => Err(FederationError::EntityResolution(err.message.clone())),
                None => Err(FederationError::DataExtraction("response contains no data".to_string())),
            },
        }
    }

    /// Group representations by `__typename` and resolve each group concurrently.
    ///
    /// The results follow the order in which the types first appear.
    pub async fn resolve_references(
        &self,
        entities: &[FederatedEntity],
        representations: Vec<RepresentationRequest>,
    ) -> Result<Vec<ConstValue>> {
        let mut groups: IndexMap<String, Vec<RepresentationRequest>> = IndexMap::new();
        for representation in representations {
            groups
                .entry(representation.type_name.clone())
                .or_default()
                .push(representation);
        }

        let lookups = groups
            .iter()
            .map(|(type_name, representations)| {
                let entity = owning_entity(entities, type_name).ok_or_else(|| {
                    FederationError::Validation(format!("unknown entity type {type_name}"))
                })?;
                Ok(self.resolve_entities(entity, representations))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(try_join_all(lookups).await?.into_iter().flatten().collect())
    }
}

/// The definition of `type_name` that can resolve it: resolvable keys whose fields the
/// service defines itself.
pub(crate) fn owning_entity<'a>(entities: &'a [FederatedEntity], type_name: &str) -> Option<&'a FederatedEntity> {
    let candidates = || entities.iter().filter(move |entity| entity.type_name == type_name);
    candidates()
        .find(|entity| {
            !entity.directives.is_external() &&
                entity.directives.keys.iter().any(|key| key.resolvable) &&
                entity
                    .key_fields()
                    .iter()
                    .all(|key| entity.field(key).map(|field| !field.is_external()).unwrap_or_default())
        })
        .or_else(|| candidates().next())
}
