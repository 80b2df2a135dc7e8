use graphfed_schema::SchemaSnapshot;

use crate::ServiceConfig;

/// Service keyword and the field names typically served by such a service.
const FIELD_KEYWORDS: &[(&str, &[&str])] = &[
    ("user", &["users", "user", "profile", "account", "authentication"]),
    ("product", &["products", "product", "catalog", "inventory", "item"]),
    ("order", &["orders", "order", "purchase", "transaction", "payment"]),
    ("review", &["reviews", "review", "rating", "comment", "feedback"]),
    ("auth", &["login", "logout", "register", "authenticate", "token"]),
];

/// Field keyword and the endpoint path fragments of services serving such fields.
const ENDPOINT_PATTERNS: &[(&str, &[&str])] = &[
    ("user", &["/user", "/users", "/auth", "/account"]),
    ("product", &["/product", "/products", "/catalog", "/inventory"]),
    ("order", &["/order", "/orders", "/purchase", "/payment"]),
    ("review", &["/review", "/reviews", "/rating", "/comment"]),
];

/// Decides which service owns a root field.
///
/// Registered root-operation fields win. Without a registration the name-based heuristics are
/// tried tier by tier, and the first configured service is the final fallback.
pub struct OwnershipResolver<'a> {
    services: &'a [ServiceConfig],
    registry: Option<&'a SchemaSnapshot>,
}

impl<'a> OwnershipResolver<'a> {
    pub fn new(services: &'a [ServiceConfig]) -> Self {
        Self {
            services,
            registry: None,
        }
    }

    pub fn registry(self, registry: &'a SchemaSnapshot) -> Self {
        Self {
            registry: Some(registry),
            ..self
        }
    }

    /// The owner of the root field `field`, `None` only when no service is configured.
    pub fn resolve(&self, field: &str) -> Option<&'a ServiceConfig> {
        if let Some(service) = self.resolve_from_registry(field) {
            return Some(service);
        }

        let field_lower = field.to_lowercase();
        let tiers: [&dyn Fn(&ServiceConfig) -> bool; 4] = [
            &|service| matches_service_name(&field_lower, service),
            &|service| matches_keyword(&field_lower, service),
            &|service| !service.schema.is_empty() && service.schema.contains(field),
            &|service| service.schema.is_empty() && matches_endpoint(&field_lower, service),
        ];

        for (tier, matches) in tiers.iter().enumerate() {
            if let Some(service) = self.services.iter().find(|&service| matches(service)) {
                tracing::debug!(field = %field, service = %service.name, tier, "Resolved field owner");
                return Some(service);
            }
        }

        let fallback = self.services.first();
        if let Some(service) = fallback {
            tracing::debug!(field = %field, service = %service.name, "No owner matched, using the first service");
        }
        fallback
    }

    fn resolve_from_registry(&self, field: &str) -> Option<&'a ServiceConfig> {
        let registry = self.registry?;
        registry
            .root_field_owners(field)
            .iter()
            .find_map(|owner| self.services.iter().find(|service| &service.name == owner))
    }
}

fn matches_service_name(field: &str, service: &ServiceConfig) -> bool {
    let name = service.name.to_lowercase();
    !field.is_empty() && (field.contains(&name) || name.contains(field))
}

fn matches_keyword(field: &str, service: &ServiceConfig) -> bool {
    let name = service.name.to_lowercase();
    FIELD_KEYWORDS
        .iter()
        .filter(|(keyword, _)| name.contains(keyword))
        .any(|(_, fields)| fields.iter().any(|mapped| field.contains(mapped)))
}

fn matches_endpoint(field: &str, service: &ServiceConfig) -> bool {
    if service.endpoint.is_empty() {
        return false;
    }
    let endpoint = service.endpoint.to_lowercase();
    if endpoint.contains(field) {
        return true;
    }
    ENDPOINT_PATTERNS
        .iter()
        .filter(|(keyword, _)| field.contains(keyword))
        .any(|(_, patterns)| patterns.iter().any(|pattern| endpoint.contains(pattern)))
}

#[cfg(test)]
mod tests {
    use graphfed_schema::{InMemorySchemaRegistry, SchemaRegistry};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn services() -> Vec<ServiceConfig> {
        vec![
            ServiceConfig::new("accounts", "http://accounts.local").schema("type Query { me: User }"),
            ServiceConfig::new("users-service", "http://users.local").schema("type Query { users: [User] }"),
            ServiceConfig::new("product-catalog", "http://products.local")
                .schema("type Query { topProducts: [Product] }"),
            ServiceConfig::new("reviews", "http://reviews.local").schema("type Query { latestReviews: [Review] }"),
        ]
    }

    #[test_case("users", "users-service" ; "service name")]
    #[test_case("profile", "users-service" ; "keyword table")]
    #[test_case("inventory", "product-catalog" ; "keyword table product")]
    #[test_case("me", "accounts" ; "schema text")]
    #[test_case("latestReviews", "reviews" ; "name contains service")]
    #[test_case("somethingElse", "accounts" ; "fallback to first")]
    fn heuristic_owner(field: &str, expected: &str) {
        let services = services();
        let resolver = OwnershipResolver::new(&services);
        assert_eq!(resolver.resolve(field).map(|service| service.name.as_str()), Some(expected));
    }

    #[test]
    fn endpoint_patterns_apply_without_schema() {
        let services = vec![
            ServiceConfig::new("alpha", "http://gateway.local/catalog"),
            ServiceConfig::new("beta", "http://gateway.local/users"),
        ];
        let resolver = OwnershipResolver::new(&services);
        assert_eq!(resolver.resolve("userById").map(|service| service.name.as_str()), Some("beta"));
        assert_eq!(resolver.resolve("productList").map(|service| service.name.as_str()), Some("alpha"));
    }

    #[test]
    fn registered_root_fields_win() {
        let registry = InMemorySchemaRegistry::new();
        registry
            .register_schema("reviews", "type Query { users: [String] }")
            .unwrap();
        let snapshot = registry.snapshot();

        let services = services();
        let resolver = OwnershipResolver::new(&services).registry(&snapshot);
        assert_eq!(resolver.resolve("users").map(|service| service.name.as_str()), Some("reviews"));
    }

    #[test]
    fn no_services_no_owner() {
        let resolver = OwnershipResolver::new(&[]);
        assert!(resolver.resolve("users").is_none());
    }
}
